//! Collector Service - Downloads per-dataset municipal statistics from the
//! data.bl.ch open government data API
//!
//! Responsibilities:
//! - Query the paginated records endpoint for every configured dataset
//! - Restrict each query to the target municipalities via a `where` filter
//! - Apply rate limiting to avoid degrading the remote API
//! - Write one `export_<id>.csv` per dataset for the merger service
//! - Skip rewriting exports whose content is unchanged (sha256 sidecar)
//! - Write a run report for auditing
//!
//! Usage:
//!   # All configured datasets:
//!   cargo run --bin collector
//!
//!   # Single dataset:
//!   cargo run --bin collector -- --dataset 10630
//!
//!   # Re-download even if cached:
//!   cargo run --bin collector -- --force

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "Collects municipal statistics exports from data.bl.ch")]
struct Args {
    /// Only fetch this dataset id (5-digit key)
    #[arg(long)]
    dataset: Option<String>,

    /// Force re-download even if the export is unchanged
    #[arg(long, default_value = "false")]
    force: bool,

    /// Dry run - fetch but don't write exports
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Export directory (overrides EXPORT_DIR)
    #[arg(long)]
    export_dir: Option<String>,
}

// =============================================================================
// Dataset Configuration
// =============================================================================

/// Records per page. The API returns a short page at the end of a result set.
const PAGE_SIZE: usize = 100;

/// Delay between successive pages of the same dataset.
const PAGE_DELAY_MS: u64 = 100;

/// Attempts per page before giving up on the dataset.
const MAX_ATTEMPTS: u32 = 3;

/// Dataset id -> name of the municipality column in that dataset.
/// The column differs per dataset family, so the `where` filter has to be
/// built against the right one.
const DATASET_MUNICIPALITY_COLUMNS: &[(&str, &str)] = &[
    ("10060", "gemeinde"),
    ("10080", "gemeinde"),
    ("10180", "bfs_bezeichnung"),
    ("10200", "gemeinde"),
    ("10230", "gemeinde"),
    ("10580", "gemeinde"),
    ("10630", "gemeinde"),
    ("10680", "gemeinde"),
    ("12070", "gemeinde"),
    ("12880", "gemeindename"),
    ("12900", "gemeindename"),
    ("13010", "gemeinde_text"),
    ("13030", "gemeinde_text"),
];

/// The tax dataset carries many indicators; only two are needed downstream.
const TAX_DATASET_ID: &str = "10630";
const TAX_INDICATOR_FILTER: &str =
    "(indikator = \"Anzahl_Steuerpflichtige\" OR indikator = \"Steuerbares_Einkommen_CHF\")";

/// Target municipalities of the canton Basel-Landschaft. The trailing `*` in
/// the filter also matches name variants with a " (BL)" suffix.
const TARGET_MUNICIPALITIES: &[&str] = &[
    "Aesch (BL)", "Allschwil", "Anwil", "Arboldswil", "Arisdorf", "Arlesheim", "Augst",
    "Bennwil", "Biel-Benken", "Binningen", "Birsfelden", "Blauen", "Böckten", "Bottmingen",
    "Bretzwil", "Brislach", "Bubendorf", "Buckten", "Burg im Leimental", "Buus", "Diegten",
    "Diepflingen", "Dittingen", "Duggingen", "Eptingen", "Ettingen", "Frenkendorf",
    "Füllinsdorf", "Gelterkinden", "Giebenach", "Grellingen", "Häfelfingen", "Hemmiken",
    "Hersberg", "Hölstein", "Itingen", "Känerkinden", "Kilchberg (BL)", "Lampenberg",
    "Langenbruck", "Läufelfingen", "Laufen", "Lausen", "Lauwil", "Liedertswil", "Liesberg",
    "Liestal", "Lupsingen", "Maisprach", "Münchenstein", "Muttenz", "Nenzlingen",
    "Niederdorf", "Nusshof", "Oberdorf (BL)", "Oberwil (BL)", "Oltingen", "Ormalingen",
    "Pfeffingen", "Pratteln", "Ramlinsburg", "Reigoldswil", "Reinach (BL)", "Rickenbach (BL)",
    "Roggenburg", "Röschenz", "Rothenfluh", "Rümlingen", "Rünenberg", "Schönenbuch",
    "Seltisberg", "Sissach", "Tecknau", "Tenniken", "Therwil", "Thürnen", "Titterten",
    "Wahlen", "Waldenburg", "Wenslingen", "Wintersingen", "Wittinsburg",
];

#[derive(Debug, Clone)]
struct Config {
    api_base: String,
    export_dir: PathBuf,
    rate_limit_ms: u64,
}

impl Config {
    fn from_env() -> Self {
        Self {
            api_base: std::env::var("API_BASE_URL").unwrap_or_else(|_| {
                "https://data.bl.ch/api/explore/v2.1/catalog".to_string()
            }),
            export_dir: PathBuf::from(
                std::env::var("EXPORT_DIR").unwrap_or_else(|_| "./data/exporte".to_string()),
            ),
            rate_limit_ms: std::env::var("RATE_LIMIT_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        }
    }
}

// =============================================================================
// Filter Expression
// =============================================================================

/// Build the `where` expression for one dataset: a prefix match per target
/// municipality, for the tax dataset additionally narrowed to the two
/// indicators used downstream.
fn build_where_clause(dataset_id: &str, municipality_column: &str) -> String {
    let filters: Vec<String> = TARGET_MUNICIPALITIES
        .iter()
        .map(|m| format!("{} like \"{}*\"", municipality_column, m))
        .collect();
    let mut clause = format!("({})", filters.join(" OR "));
    if dataset_id == TAX_DATASET_ID {
        clause.push_str(" AND ");
        clause.push_str(TAX_INDICATOR_FILTER);
    }
    clause
}

// =============================================================================
// Fetcher
// =============================================================================

/// One page of the records endpoint. Fields beyond `results` are ignored.
#[derive(Debug, Deserialize)]
struct RecordsPage {
    #[serde(default)]
    results: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Fetch all pages of one dataset. Pagination stops on an empty or short
/// page. A page that still fails after MAX_ATTEMPTS ends the dataset early;
/// whatever was collected so far is returned, never an error.
async fn fetch_dataset(
    client: &reqwest::Client,
    config: &Config,
    dataset_id: &str,
    where_clause: &str,
) -> Vec<serde_json::Map<String, serde_json::Value>> {
    let url = format!("{}/datasets/{}/records", config.api_base, dataset_id);
    let mut all_records = Vec::new();
    let mut offset = 0usize;

    loop {
        let page = match fetch_page(client, &url, where_clause, offset).await {
            Ok(page) => page,
            Err(e) => {
                eprintln!("  ✗ Dataset {}: giving up at offset {}: {}", dataset_id, offset, e);
                break;
            }
        };

        let count = page.results.len();
        if count == 0 {
            break;
        }
        all_records.extend(page.results);
        if count < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
        sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
    }

    all_records
}

/// Fetch a single page with bounded retry and linear backoff.
async fn fetch_page(
    client: &reqwest::Client,
    url: &str,
    where_clause: &str,
    offset: usize,
) -> Result<RecordsPage> {
    let mut last_error = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            sleep(Duration::from_millis(500 * (attempt as u64 - 1))).await;
        }

        let request = client.get(url).query(&[
            ("limit", PAGE_SIZE.to_string()),
            ("offset", offset.to_string()),
            ("where", where_clause.to_string()),
        ]);

        match request.send().await {
            Ok(resp) => {
                if !resp.status().is_success() {
                    last_error = Some(anyhow::anyhow!("HTTP {}", resp.status()));
                    continue;
                }
                match resp.json::<RecordsPage>().await {
                    Ok(page) => return Ok(page),
                    Err(e) => {
                        last_error = Some(anyhow::anyhow!("invalid JSON body: {}", e));
                        continue;
                    }
                }
            }
            Err(e) => {
                last_error = Some(anyhow::anyhow!("transport error: {}", e));
                continue;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no attempt made")))
}

// =============================================================================
// Export Rendering
// =============================================================================

/// Render one JSON value as a CSV cell. Scalars are written verbatim,
/// nested values as compact JSON.
fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Collapse ad hoc records into a rectangular table. Columns are the sorted
/// union of all record keys so the export is deterministic regardless of
/// per-record field order; records missing a key get an empty cell.
fn records_to_table(
    records: &[serde_json::Map<String, serde_json::Value>],
) -> (Vec<String>, Vec<Vec<String>>) {
    let columns: Vec<String> = records
        .iter()
        .flat_map(|r| r.keys().cloned())
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            columns
                .iter()
                .map(|c| r.get(c).map(cell_text).unwrap_or_default())
                .collect()
        })
        .collect();

    (columns, rows)
}

/// Serialize the table as UTF-8 CSV.
fn table_to_csv(columns: &[String], rows: &[Vec<String>]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row)?;
    }
    let bytes = writer.into_inner().context("Failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output was not valid UTF-8")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Check the sidecar of a previous run; identical content is not rewritten.
async fn export_is_unchanged(sidecar: &Path, content_hash: &str) -> bool {
    match fs::read_to_string(sidecar).await {
        Ok(previous) => previous.trim() == content_hash,
        Err(_) => false,
    }
}

// =============================================================================
// Run Report
// =============================================================================

#[derive(Debug, Serialize)]
struct DatasetReport {
    dataset_id: String,
    status: String,
    rows: usize,
    columns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CollectReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    api_base: String,
    export_dir: String,
    datasets: Vec<DatasetReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(dir) = &args.export_dir {
        config.export_dir = PathBuf::from(dir);
    }

    println!("=== OGD BL Collector ===");
    println!("API base: {}", config.api_base);
    println!("Export dir: {}", config.export_dir.display());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent("StatistikPipelineBL/1.0 (municipal statistics research pipeline)")
        .build()?;

    let datasets: Vec<(&str, &str)> = DATASET_MUNICIPALITY_COLUMNS
        .iter()
        .copied()
        .filter(|(id, _)| match &args.dataset {
            Some(filter) => *id == filter.as_str(),
            None => true,
        })
        .collect();

    if datasets.is_empty() {
        anyhow::bail!(
            "No configured dataset matches --dataset {:?}. Known ids: {}",
            args.dataset,
            DATASET_MUNICIPALITY_COLUMNS
                .iter()
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    if !args.dry_run {
        fs::create_dir_all(&config.export_dir)
            .await
            .context("Failed to create export directory")?;
    }

    let started_at = Utc::now();
    println!("\nProcessing {} dataset(s)...", datasets.len());

    let mut reports = Vec::new();
    let mut collected = 0;
    let mut skipped = 0;

    for (dataset_id, municipality_column) in datasets {
        println!("\n[{}] municipality column: {}", dataset_id, municipality_column);

        // Rate limit: wait before the first request of each dataset
        sleep(Duration::from_millis(config.rate_limit_ms)).await;

        let where_clause = build_where_clause(dataset_id, municipality_column);
        let records = fetch_dataset(&client, &config, dataset_id, &where_clause).await;

        if records.is_empty() {
            println!("  ⚠ No rows returned (check the municipality column)");
            skipped += 1;
            reports.push(DatasetReport {
                dataset_id: dataset_id.to_string(),
                status: "empty".to_string(),
                rows: 0,
                columns: 0,
                file: None,
                content_hash: None,
                error: None,
            });
            continue;
        }

        let (columns, rows) = records_to_table(&records);
        let filename = format!("export_{}.csv", dataset_id);
        let path = config.export_dir.join(&filename);

        let report = match table_to_csv(&columns, &rows) {
            Ok(content) => {
                let content_hash = sha256_hex(content.as_bytes());
                let sidecar = config.export_dir.join(format!("{}.sha256", filename));

                if args.dry_run {
                    println!("  ✓ Dry run - would write {} rows to {}", rows.len(), path.display());
                    collected += 1;
                    DatasetReport {
                        dataset_id: dataset_id.to_string(),
                        status: "dry-run".to_string(),
                        rows: rows.len(),
                        columns: columns.len(),
                        file: Some(filename),
                        content_hash: Some(content_hash),
                        error: None,
                    }
                } else if !args.force && export_is_unchanged(&sidecar, &content_hash).await {
                    println!("  ✓ Unchanged: {} rows, export already up to date", rows.len());
                    collected += 1;
                    DatasetReport {
                        dataset_id: dataset_id.to_string(),
                        status: "unchanged".to_string(),
                        rows: rows.len(),
                        columns: columns.len(),
                        file: Some(filename),
                        content_hash: Some(content_hash),
                        error: None,
                    }
                } else {
                    match fs::write(&path, &content).await {
                        Ok(()) => {
                            fs::write(&sidecar, &content_hash).await.ok();
                            println!(
                                "  ✓ Saved {} rows x {} columns to {}",
                                rows.len(),
                                columns.len(),
                                path.display()
                            );
                            collected += 1;
                            DatasetReport {
                                dataset_id: dataset_id.to_string(),
                                status: "ok".to_string(),
                                rows: rows.len(),
                                columns: columns.len(),
                                file: Some(filename),
                                content_hash: Some(content_hash),
                                error: None,
                            }
                        }
                        Err(e) => {
                            eprintln!("  ✗ Write failed: {}", e);
                            skipped += 1;
                            DatasetReport {
                                dataset_id: dataset_id.to_string(),
                                status: "failed".to_string(),
                                rows: rows.len(),
                                columns: columns.len(),
                                file: Some(filename),
                                content_hash: None,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("  ✗ Render failed: {}", e);
                skipped += 1;
                DatasetReport {
                    dataset_id: dataset_id.to_string(),
                    status: "failed".to_string(),
                    rows: rows.len(),
                    columns: columns.len(),
                    file: None,
                    content_hash: None,
                    error: Some(e.to_string()),
                }
            }
        };
        reports.push(report);
    }

    let report = CollectReport {
        started_at,
        finished_at: Utc::now(),
        api_base: config.api_base.clone(),
        export_dir: config.export_dir.to_string_lossy().to_string(),
        datasets: reports,
    };

    if !args.dry_run {
        let report_path = config.export_dir.join("collect_report.json");
        let body = serde_json::to_string_pretty(&report)?;
        fs::write(&report_path, body)
            .await
            .context("Failed to write run report")?;
        println!("\nRun report: {}", report_path.display());
    }

    println!("\n=== Collection Summary ===");
    println!("Collected: {}", collected);
    println!("Skipped/failed: {}", skipped);

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // -------------------------------------------------------------------------
    // WHERE CLAUSE TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_where_clause_contains_all_targets() {
        let clause = build_where_clause("10060", "gemeinde");
        assert!(clause.starts_with('('));
        assert!(clause.contains("gemeinde like \"Aesch (BL)*\""));
        assert!(clause.contains("gemeinde like \"Wittinsburg*\""));
        assert_eq!(
            clause.matches(" OR ").count(),
            TARGET_MUNICIPALITIES.len() - 1
        );
    }

    #[test]
    fn test_where_clause_uses_dataset_column() {
        let clause = build_where_clause("13030", "gemeinde_text");
        assert!(clause.contains("gemeinde_text like \"Liestal*\""));
        assert!(!clause.contains("gemeindename like"));
    }

    #[test]
    fn test_where_clause_tax_dataset_adds_indicator_filter() {
        let clause = build_where_clause("10630", "gemeinde");
        assert!(clause.ends_with(TAX_INDICATOR_FILTER));
        assert!(clause.contains(" AND "));
        assert!(clause.contains("Anzahl_Steuerpflichtige"));
        assert!(clause.contains("Steuerbares_Einkommen_CHF"));
    }

    #[test]
    fn test_where_clause_other_datasets_have_no_indicator_filter() {
        let clause = build_where_clause("10580", "gemeinde");
        assert!(!clause.contains("indikator"));
    }

    // -------------------------------------------------------------------------
    // TABLE RENDERING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_records_to_table_union_of_columns_sorted() {
        let records = vec![
            record(&[("jahr", json!(2020)), ("wert", json!(5))]),
            record(&[("gemeinde", json!("Liestal")), ("jahr", json!(2021))]),
        ];
        let (columns, rows) = records_to_table(&records);
        assert_eq!(columns, vec!["gemeinde", "jahr", "wert"]);
        assert_eq!(rows[0], vec!["", "2020", "5"]);
        assert_eq!(rows[1], vec!["Liestal", "2021", ""]);
    }

    #[test]
    fn test_records_to_table_empty() {
        let (columns, rows) = records_to_table(&[]);
        assert!(columns.is_empty());
        assert!(rows.is_empty());
    }

    #[test]
    fn test_cell_text_scalars() {
        assert_eq!(cell_text(&json!(null)), "");
        assert_eq!(cell_text(&json!("Muttenz")), "Muttenz");
        assert_eq!(cell_text(&json!(42)), "42");
        assert_eq!(cell_text(&json!(3.5)), "3.5");
        assert_eq!(cell_text(&json!(true)), "true");
    }

    #[test]
    fn test_cell_text_nested_values_render_as_json() {
        assert_eq!(cell_text(&json!([1, 2])), "[1,2]");
        assert_eq!(cell_text(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_table_to_csv_round_trip() {
        let columns = vec!["gemeinde".to_string(), "wert".to_string()];
        let rows = vec![vec!["Aesch (BL)".to_string(), "7".to_string()]];
        let csv = table_to_csv(&columns, &rows).unwrap();
        assert_eq!(csv, "gemeinde,wert\nAesch (BL),7\n");
    }

    #[test]
    fn test_table_to_csv_quotes_commas() {
        let columns = vec!["name".to_string()];
        let rows = vec![vec!["a,b".to_string()]];
        let csv = table_to_csv(&columns, &rows).unwrap();
        assert_eq!(csv, "name\n\"a,b\"\n");
    }

    // -------------------------------------------------------------------------
    // HASHING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_sha256_hex_is_stable() {
        let a = sha256_hex(b"jahr,wert\n2020,5\n");
        let b = sha256_hex(b"jahr,wert\n2020,5\n");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }

    #[test]
    fn test_sha256_hex_differs_on_content() {
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
    }

    // -------------------------------------------------------------------------
    // CONFIGURATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_dataset_ids_are_sorted_and_unique() {
        let ids: Vec<&str> = DATASET_MUNICIPALITY_COLUMNS.iter().map(|(id, _)| *id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 13);
    }

    #[test]
    fn test_page_deserializes_without_results() {
        let page: RecordsPage = serde_json::from_str("{\"total_count\": 0}").unwrap();
        assert!(page.results.is_empty());
    }
}
