//! Merger Service - Assembles the municipal master table from per-dataset exports
//!
//! Responsibilities:
//! - Scan the export directory for the configured `export_<id>.csv` files
//! - Build the BFS name map once in a bounded pre-pass over all exports
//! - Resolve municipality/year columns per dataset via alias lookup
//! - Strip district/canton/total aggregate rows
//! - Expand year-range tokens ("2010/2014") into one row per calendar year
//! - Pivot categorical layers into wide columns, aggregate the rest
//! - Outer-join every layer into one table keyed by (year, BFS number)
//! - Derive household-size and nationality-share features
//! - Write the master CSV and a merge report
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same exports + same flags = same master table
//!
//! Usage:
//!   cargo run --bin merger
//!   cargo run --bin merger -- --missing-policy drop --min-year 2015

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "merger", about = "Merges per-dataset exports into the master table")]
struct Args {
    /// Directory holding export_<id>.csv files (overrides EXPORT_DIR)
    #[arg(long)]
    source_dir: Option<String>,

    /// Output path for the master table (overrides MASTER_TABLE)
    #[arg(long)]
    output: Option<String>,

    /// Rows before this year are dropped after range expansion
    #[arg(long, default_value = "2010")]
    min_year: i32,

    /// How unparseable values and merge gaps are handled
    #[arg(long, value_enum, default_value = "zero-fill")]
    missing_policy: MissingPolicy,
}

/// The two cleaning variants for values that fail numeric parsing.
/// `zero-fill` coerces them to 0.0 and writes merge gaps as 0.0;
/// `drop` removes the affected row and leaves merge gaps empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MissingPolicy {
    ZeroFill,
    Drop,
}

impl MissingPolicy {
    fn label(self) -> &'static str {
        match self {
            MissingPolicy::ZeroFill => "zero-fill",
            MissingPolicy::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    source_dir: PathBuf,
    output: PathBuf,
}

impl Config {
    fn resolve(args: &Args) -> Self {
        let source_dir = args
            .source_dir
            .clone()
            .or_else(|| std::env::var("EXPORT_DIR").ok())
            .unwrap_or_else(|| "./data/exporte".to_string());
        let output = args
            .output
            .clone()
            .or_else(|| std::env::var("MASTER_TABLE").ok())
            .unwrap_or_else(|| "./data/master_table.csv".to_string());
        Self {
            source_dir: PathBuf::from(source_dir),
            output: PathBuf::from(output),
        }
    }
}

// =============================================================================
// Layer Configuration
// =============================================================================

/// Shape of one dataset: which columns pivot into wide categories and which
/// carry the numeric values.
#[derive(Debug)]
struct LayerConfig {
    id: &'static str,
    pivot: &'static [&'static str],
    value: &'static [&'static str],
}

/// All known datasets, ascending by id. The merge processes them in this
/// order, which fixes the column order of the master table.
const LAYER_CONFIGS: &[LayerConfig] = &[
    LayerConfig { id: "10060", pivot: &["haushaltsgrosse"], value: &["wert"] },
    LayerConfig { id: "10080", pivot: &["nationalitaet"], value: &["anzahl_personen"] },
    LayerConfig { id: "10180", pivot: &["staatsangehoerigkeit_kategorie"], value: &["anzahl"] },
    LayerConfig { id: "10200", pivot: &[], value: &["falle", "flache_in_m2", "quadratmeterpreis_chf"] },
    LayerConfig { id: "10230", pivot: &[], value: &["neu_erstellte_wohnungen"] },
    LayerConfig { id: "10580", pivot: &["indikator"], value: &["wert"] },
    LayerConfig { id: "10630", pivot: &["indikator"], value: &["wert"] },
    LayerConfig {
        id: "10680",
        pivot: &[],
        value: &[
            "anfangsbestand", "geburten", "todesfaelle", "zuzuege", "wegzuege",
            "wanderungssaldo", "endbestand",
        ],
    },
    LayerConfig { id: "12070", pivot: &[], value: &["falle", "flache_in_m2", "quadratmeterpreis_chf"] },
    LayerConfig { id: "12880", pivot: &[], value: &["anzahl_bewilligungen"] },
    LayerConfig { id: "12900", pivot: &[], value: &["anzahl_bauprojekte"] },
    LayerConfig { id: "13010", pivot: &["anzahl_zimmer"], value: &["schatzwert"] },
    LayerConfig { id: "13030", pivot: &["bewohnertyp_text"], value: &["schatzwert"] },
];

/// Known BFS municipality-number column names across the dataset families.
const BFS_CODE_COLUMNS: &[&str] = &[
    "bfs_gemeindenummer", "gemeinde_code", "gemeinde_nummer", "bfs_nummer", "bfs_code", "gem_nr",
];

/// Known municipality-name column names. `bfs_bezeichnung` is the odd one
/// out, used by the citizenship dataset.
const MUNICIPALITY_COLUMNS: &[&str] = &[
    "gemeinde_text", "gemeindename", "gemeinde", "bfs_bezeichnung", "bezeichnung",
];

/// Year column candidates, in preference order. `periode` may hold range
/// tokens like "2010/2014".
const YEAR_COLUMNS: &[&str] = &["periode", "jahr"];

/// Rows whose municipality name starts with one of these are district,
/// canton or total aggregates, not leaf municipalities.
const EXCLUDED_NAME_PREFIXES: &[&str] = &["bezirk", "kanton", "total"];

// =============================================================================
// Slugs, Year Tokens, Numeric Cleaning
// =============================================================================

/// Normalize a raw label into a column-safe slug: lower-case, transliterate
/// umlauts, "+" -> "plus", "/" and "-" -> "_", "." removed, everything else
/// non-alphanumeric collapsed to single underscores. Idempotent.
fn slugify(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }

    let mut expanded = String::with_capacity(trimmed.len());
    for c in trimmed.to_lowercase().chars() {
        match c {
            'ä' => expanded.push_str("ae"),
            'ö' => expanded.push_str("oe"),
            'ü' => expanded.push_str("ue"),
            'ß' => expanded.push_str("ss"),
            '+' => expanded.push_str("plus"),
            '/' | '-' => expanded.push('_'),
            '.' => {}
            other => expanded.push(other),
        }
    }

    let mut slug = String::with_capacity(expanded.len());
    let mut pending_separator = false;
    for c in expanded.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            slug.push(c);
            pending_separator = false;
        } else {
            pending_separator = true;
        }
    }

    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Expand a raw year token. A leading "YYYY/YYYY" or "YYYY-YYYY" becomes the
/// inclusive range (empty when end < start); otherwise the first run of four
/// digits is the year; otherwise the token is unparseable and the row is
/// dropped by the caller.
fn expand_year_token(raw: &str) -> Vec<i32> {
    let chars: Vec<char> = raw.trim().chars().collect();

    let is_digits = |slice: &[char]| slice.iter().all(|c| c.is_ascii_digit());

    if chars.len() >= 9
        && is_digits(&chars[..4])
        && matches!(chars[4], '/' | '-')
        && is_digits(&chars[5..9])
    {
        let start = chars[..4].iter().collect::<String>().parse::<i32>();
        let end = chars[5..9].iter().collect::<String>().parse::<i32>();
        if let (Ok(start), Ok(end)) = (start, end) {
            return (start..=end).collect();
        }
    }

    for window_start in 0..chars.len().saturating_sub(3) {
        let window = &chars[window_start..window_start + 4];
        if is_digits(window) {
            if let Ok(year) = window.iter().collect::<String>().parse::<i32>() {
                return vec![year];
            }
        }
    }

    Vec::new()
}

/// Coerce a raw field to a number by stripping every character that is not
/// an ASCII digit or decimal point. Handles Swiss thousands separators
/// ("1'234.50") and unit suffixes ("CHF 25.-"); minus signs are stripped
/// with everything else.
fn clean_numeric(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Municipality names carry canton suffixes like "Aesch (BL)"; the base name
/// is everything before the first " (".
fn strip_parenthetical(raw: &str) -> &str {
    match raw.split_once(" (") {
        Some((base, _)) => base.trim(),
        None => raw.trim(),
    }
}

fn is_aggregate_name(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    EXCLUDED_NAME_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

/// BFS numbers arrive as "2761" or "2761.0" depending on the export.
fn parse_bfs_code(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = trimmed.parse::<f64>().ok()?;
    if !value.is_finite() || value <= 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value as u32)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// =============================================================================
// Raw Table
// =============================================================================

/// An export as read from disk: lower-cased headers plus untyped string rows.
#[derive(Debug)]
struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Parse CSV content. Column names are trimmed and lower-cased; rows are
    /// padded or truncated to the header width. Malformed lines are skipped
    /// with a warning, never an error.
    fn from_csv(content: &str) -> Result<Self> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        let mut rows = Vec::new();
        for (line_idx, result) in reader.records().enumerate() {
            match result {
                Ok(record) => {
                    let mut row: Vec<String> = record.iter().map(|f| f.to_string()).collect();
                    row.resize(headers.len(), String::new());
                    rows.push(row);
                }
                Err(e) => {
                    eprintln!("Warning: skipping line {} due to error: {}", line_idx + 2, e);
                }
            }
        }

        Ok(Self { headers, rows })
    }
}

/// Decode export bytes: UTF-8 first (BOM stripped), Windows-1252 as fallback
/// for hand-edited files.
fn decode_export(bytes: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    text.into_owned()
}

// =============================================================================
// Column Resolution
// =============================================================================

/// Resolved key columns of one export. Any role may be missing; the caller
/// decides whether that excludes the dataset.
#[derive(Debug)]
struct KeyColumns {
    bfs: Option<usize>,
    name: Option<usize>,
    year: Option<usize>,
}

/// Find a column by alias. Exact matches win over substring matches; within
/// a pass the leftmost column wins. `skip` excludes a column already claimed
/// by another role.
fn find_column(headers: &[String], candidates: &[&str], skip: Option<usize>) -> Option<usize> {
    for (idx, header) in headers.iter().enumerate() {
        if Some(idx) == skip {
            continue;
        }
        if candidates.iter().any(|c| header.as_str() == *c) {
            return Some(idx);
        }
    }
    for (idx, header) in headers.iter().enumerate() {
        if Some(idx) == skip {
            continue;
        }
        if candidates.iter().any(|c| header.contains(*c)) {
            return Some(idx);
        }
    }
    None
}

/// The year column is resolved by candidate priority: a `periode` column
/// wins over `jahr` regardless of position.
fn find_year_column(headers: &[String]) -> Option<usize> {
    YEAR_COLUMNS
        .iter()
        .find_map(|c| headers.iter().position(|h| h.as_str() == *c))
}

fn resolve_key_columns(headers: &[String]) -> KeyColumns {
    let bfs = find_column(headers, BFS_CODE_COLUMNS, None);
    let name = find_column(headers, MUNICIPALITY_COLUMNS, bfs);
    let year = find_year_column(headers);
    KeyColumns { bfs, name, year }
}

// =============================================================================
// BFS Name Map
// =============================================================================

/// Municipality number <-> display name, built once by a pre-pass over every
/// export that carries both columns. Read-only after construction; later
/// registrations overwrite earlier ones.
#[derive(Debug, Default)]
struct BfsNameMap {
    by_code: BTreeMap<u32, String>,
    by_slug: HashMap<String, u32>,
}

impl BfsNameMap {
    fn register(&mut self, code: u32, raw_name: &str) {
        let name = strip_parenthetical(raw_name);
        if name.is_empty() {
            return;
        }
        self.by_slug.insert(slugify(name), code);
        self.by_code.insert(code, name.to_string());
    }

    /// Harvest code/name pairs from the first `max_rows` rows of an export.
    /// Tables without both key columns contribute nothing.
    fn scan_table(&mut self, table: &RawTable, max_rows: usize) {
        let keys = resolve_key_columns(&table.headers);
        let (bfs_idx, name_idx) = match (keys.bfs, keys.name) {
            (Some(b), Some(n)) => (b, n),
            _ => return,
        };
        for row in table.rows.iter().take(max_rows) {
            let code = match row.get(bfs_idx).and_then(|v| parse_bfs_code(v)) {
                Some(code) => code,
                None => continue,
            };
            if let Some(raw_name) = row.get(name_idx) {
                if !raw_name.trim().is_empty() {
                    self.register(code, raw_name);
                }
            }
        }
    }

    fn name_of(&self, code: u32) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    /// Reverse lookup for exports that only carry a name column.
    fn code_for_name(&self, raw_name: &str) -> Option<u32> {
        let base = strip_parenthetical(raw_name);
        if base.is_empty() {
            return None;
        }
        self.by_slug.get(&slugify(base)).copied()
    }

    fn len(&self) -> usize {
        self.by_code.len()
    }
}

// =============================================================================
// Row Normalizer
// =============================================================================

/// One cleaned, year-exploded observation.
#[derive(Debug, Clone)]
struct CleanRow {
    bfs: u32,
    jahr: i32,
    /// Slugified pivot label, None for aggregate-only layers.
    label: Option<String>,
    /// Aligned with `NormalizedLayer::value_columns`.
    values: Vec<f64>,
}

#[derive(Debug)]
struct NormalizedLayer {
    /// Configured value columns actually present, in config order.
    value_columns: Vec<String>,
    pivoted: bool,
    rows: Vec<CleanRow>,
    dropped: usize,
}

/// Clean one export against its layer config: resolve key columns, filter
/// aggregate rows, resolve the BFS code (directly or via the name map),
/// coerce values per the missing policy, and explode year tokens. The input
/// table is not mutated.
fn normalize_layer(
    table: &RawTable,
    config: &LayerConfig,
    names: &BfsNameMap,
    min_year: i32,
    policy: MissingPolicy,
) -> Result<NormalizedLayer> {
    let keys = resolve_key_columns(&table.headers);
    if keys.bfs.is_none() && keys.name.is_none() {
        anyhow::bail!(
            "no municipality column found, expected one of: {}",
            MUNICIPALITY_COLUMNS.join(", ")
        );
    }
    let year_idx = match keys.year {
        Some(idx) => idx,
        None => anyhow::bail!(
            "no year column found, expected one of: {}",
            YEAR_COLUMNS.join(", ")
        ),
    };

    let pivot_idx: Vec<usize> = config
        .pivot
        .iter()
        .filter_map(|p| table.headers.iter().position(|h| h.as_str() == *p))
        .collect();
    let value_cols: Vec<(String, usize)> = config
        .value
        .iter()
        .filter_map(|v| {
            table
                .headers
                .iter()
                .position(|h| h.as_str() == *v)
                .map(|idx| (v.to_string(), idx))
        })
        .collect();

    if value_cols.is_empty() {
        anyhow::bail!(
            "none of the configured value columns are present: {}",
            config.value.join(", ")
        );
    }

    let mut rows = Vec::new();
    let mut dropped = 0usize;

    for row in &table.rows {
        let name_field = keys
            .name
            .and_then(|idx| row.get(idx))
            .map(String::as_str)
            .unwrap_or("");

        // District/canton/total aggregates are not leaf municipalities.
        if !name_field.trim().is_empty() && is_aggregate_name(name_field) {
            dropped += 1;
            continue;
        }

        // BFS code preferred; name-only exports resolve through the map.
        let code = keys
            .bfs
            .and_then(|idx| row.get(idx))
            .and_then(|v| parse_bfs_code(v))
            .or_else(|| names.code_for_name(name_field));
        let code = match code {
            Some(code) => code,
            None => {
                dropped += 1;
                continue;
            }
        };

        let mut values = Vec::with_capacity(value_cols.len());
        let mut unparseable = false;
        for (_, idx) in &value_cols {
            let raw = row.get(*idx).map(String::as_str).unwrap_or("");
            match clean_numeric(raw) {
                Some(v) => values.push(v),
                None => match policy {
                    MissingPolicy::ZeroFill => values.push(0.0),
                    MissingPolicy::Drop => {
                        unparseable = true;
                        break;
                    }
                },
            }
        }
        if unparseable {
            dropped += 1;
            continue;
        }

        let label = if pivot_idx.is_empty() {
            None
        } else {
            let joined = pivot_idx
                .iter()
                .map(|idx| row.get(*idx).map(String::as_str).unwrap_or(""))
                .collect::<Vec<_>>()
                .join("_");
            Some(slugify(&joined))
        };

        let years = expand_year_token(row.get(year_idx).map(String::as_str).unwrap_or(""));
        if years.is_empty() {
            dropped += 1;
            continue;
        }
        for jahr in years {
            if jahr < min_year {
                continue;
            }
            rows.push(CleanRow {
                bfs: code,
                jahr,
                label: label.clone(),
                values: values.clone(),
            });
        }
    }

    Ok(NormalizedLayer {
        value_columns: value_cols.into_iter().map(|(name, _)| name).collect(),
        pivoted: !pivot_idx.is_empty(),
        rows,
        dropped,
    })
}

// =============================================================================
// Pivot/Aggregate Engine
// =============================================================================

/// One dataset in wide form, ready to merge. Pivot cells that never occurred
/// for a key stay None; aggregate sums are always present.
#[derive(Debug)]
struct LayerTable {
    columns: Vec<String>,
    rows: BTreeMap<(u32, i32), Vec<Option<f64>>>,
}

/// Pivot mode: one output column per distinct label, cells holding the SUM
/// of the first value column over (key, label). Aggregate mode: sum every
/// value column independently per key. Output columns are prefixed with the
/// dataset id and slugified.
fn build_layer_table(layer_id: &str, normalized: &NormalizedLayer) -> LayerTable {
    if normalized.pivoted {
        let mut labels: BTreeSet<String> = BTreeSet::new();
        let mut cells: BTreeMap<(u32, i32), BTreeMap<String, f64>> = BTreeMap::new();

        for row in &normalized.rows {
            let label = row.label.clone().unwrap_or_else(|| "unknown".to_string());
            let value = row.values.first().copied().unwrap_or(0.0);
            labels.insert(label.clone());
            *cells
                .entry((row.bfs, row.jahr))
                .or_default()
                .entry(label)
                .or_insert(0.0) += value;
        }

        let label_list: Vec<String> = labels.into_iter().collect();
        let columns = label_list
            .iter()
            .map(|label| format!("ds{}_{}", layer_id, slugify(label)))
            .collect();
        let rows = cells
            .into_iter()
            .map(|(key, by_label)| {
                let row = label_list
                    .iter()
                    .map(|label| by_label.get(label).copied())
                    .collect();
                (key, row)
            })
            .collect();

        LayerTable { columns, rows }
    } else {
        let width = normalized.value_columns.len();
        let mut cells: BTreeMap<(u32, i32), Vec<f64>> = BTreeMap::new();

        for row in &normalized.rows {
            let entry = cells
                .entry((row.bfs, row.jahr))
                .or_insert_with(|| vec![0.0; width]);
            for (i, v) in row.values.iter().enumerate() {
                entry[i] += v;
            }
        }

        let columns = normalized
            .value_columns
            .iter()
            .map(|name| format!("ds{}_{}", layer_id, slugify(name)))
            .collect();
        let rows = cells
            .into_iter()
            .map(|(key, sums)| (key, sums.into_iter().map(Some).collect()))
            .collect();

        LayerTable { columns, rows }
    }
}

// =============================================================================
// Merge Assembler
// =============================================================================

/// Extract the numeric dataset id embedded in a `ds<id>_...` column name.
fn dataset_id_of(column: &str) -> Option<u64> {
    let rest = column.strip_prefix("ds")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// The accumulating master table. Keys are (BFS number, year), which makes
/// duplicate committed keys structurally impossible.
#[derive(Debug, Default)]
struct MasterTable {
    columns: Vec<String>,
    rows: BTreeMap<(u32, i32), Vec<Option<f64>>>,
}

impl MasterTable {
    /// Outer-join one dataset onto the accumulator: keys present on either
    /// side survive, with None in the columns the other side doesn't have.
    fn merge_layer(&mut self, layer: LayerTable) {
        let old_width = self.columns.len();
        self.columns.extend(layer.columns);
        let new_width = self.columns.len();

        for row in self.rows.values_mut() {
            row.resize(new_width, None);
        }
        for (key, values) in layer.rows {
            let row = self
                .rows
                .entry(key)
                .or_insert_with(|| vec![None; new_width]);
            for (i, v) in values.into_iter().enumerate() {
                row[old_width + i] = v;
            }
        }
    }

    /// Reorder data columns ascending by embedded dataset id. The sort is
    /// stable, so the per-dataset column order is preserved.
    fn sort_columns_by_dataset(&mut self) {
        let mut order: Vec<usize> = (0..self.columns.len()).collect();
        order.sort_by_key(|&i| dataset_id_of(&self.columns[i]).unwrap_or(u64::MAX));

        let reordered: Vec<String> = order.iter().map(|&i| self.columns[i].clone()).collect();
        self.columns = reordered;
        for row in self.rows.values_mut() {
            let reordered: Vec<Option<f64>> = order.iter().map(|&i| row[i]).collect();
            *row = reordered;
        }
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

// =============================================================================
// Branded Features
// =============================================================================

/// Household-size buckets of layer 10060 with their weights; the open
/// "6 or more" bucket counts as 6.
const HOUSEHOLD_BUCKETS: &[(&str, f64)] = &[
    ("ds10060_1_person", 1.0),
    ("ds10060_2_personen", 2.0),
    ("ds10060_3_personen", 3.0),
    ("ds10060_4_personen", 4.0),
    ("ds10060_5_personen", 5.0),
    ("ds10060_6_oder_mehr_personen", 6.0),
];

const FOREIGN_POPULATION: &str = "ds10080_ausland";
const DOMESTIC_POPULATION: &str = "ds10080_schweiz";

/// Downstream naming convention for the derived columns.
const AVG_HOUSEHOLD_SIZE: &str = "ds10630_avg_haushaltsgrosse";
const FOREIGN_SHARE: &str = "ds10080_anteil_auslaender_pct";
const DOMESTIC_SHARE: &str = "ds10080_anteil_schweizer_pct";

/// Compute the derived columns from the merged raw columns and insert them
/// ahead of all data columns, in declared order. Returns the names added.
fn apply_branded_features(master: &mut MasterTable) -> Vec<String> {
    let mut derived: Vec<(String, BTreeMap<(u32, i32), f64>)> = Vec::new();

    // Average household size: weighted mean over the present buckets,
    // 0 when a row has no households at all.
    let buckets: Vec<(usize, f64)> = HOUSEHOLD_BUCKETS
        .iter()
        .filter_map(|(name, weight)| master.column_index(name).map(|idx| (idx, *weight)))
        .collect();
    if !buckets.is_empty() {
        let mut values = BTreeMap::new();
        for (key, row) in &master.rows {
            let total: f64 = buckets.iter().map(|(idx, _)| row[*idx].unwrap_or(0.0)).sum();
            let weighted: f64 = buckets
                .iter()
                .map(|(idx, weight)| row[*idx].unwrap_or(0.0) * weight)
                .sum();
            let avg = if total > 0.0 { round2(weighted / total) } else { 0.0 };
            values.insert(*key, avg);
        }
        derived.push((AVG_HOUSEHOLD_SIZE.to_string(), values));
    }

    // Nationality shares in percent, 0 when the denominator is 0.
    let nationality = (
        master.column_index(FOREIGN_POPULATION),
        master.column_index(DOMESTIC_POPULATION),
    );
    if let (Some(foreign_idx), Some(domestic_idx)) = nationality {
        let mut foreign_values = BTreeMap::new();
        let mut domestic_values = BTreeMap::new();
        for (key, row) in &master.rows {
            let foreign = row[foreign_idx].unwrap_or(0.0);
            let domestic = row[domestic_idx].unwrap_or(0.0);
            let total = foreign + domestic;
            if total > 0.0 {
                foreign_values.insert(*key, round2(foreign / total * 100.0));
                domestic_values.insert(*key, round2(domestic / total * 100.0));
            } else {
                foreign_values.insert(*key, 0.0);
                domestic_values.insert(*key, 0.0);
            }
        }
        derived.push((FOREIGN_SHARE.to_string(), foreign_values));
        derived.push((DOMESTIC_SHARE.to_string(), domestic_values));
    }

    let added: Vec<String> = derived.iter().map(|(name, _)| name.clone()).collect();
    for (offset, (name, values)) in derived.into_iter().enumerate() {
        master.columns.insert(offset, name);
        for (key, row) in master.rows.iter_mut() {
            row.insert(offset, Some(values.get(key).copied().unwrap_or(0.0)));
        }
    }
    added
}

// =============================================================================
// Output
// =============================================================================

fn format_cell(value: f64) -> String {
    format!("{}", value)
}

/// Render the master table: key columns first, rows sorted by municipality
/// name, BFS number, year. Merge gaps become 0 or empty per the policy.
fn render_master_csv(
    master: &MasterTable,
    names: &BfsNameMap,
    policy: MissingPolicy,
) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec![
        "jahr".to_string(),
        "bfs_nummer".to_string(),
        "gemeinde".to_string(),
    ];
    header.extend(master.columns.iter().cloned());
    writer.write_record(&header)?;

    let mut ordered: Vec<(&(u32, i32), &Vec<Option<f64>>)> = master.rows.iter().collect();
    ordered.sort_by(|a, b| {
        let name_a = names.name_of(a.0 .0).unwrap_or("");
        let name_b = names.name_of(b.0 .0).unwrap_or("");
        name_a
            .cmp(name_b)
            .then(a.0 .0.cmp(&b.0 .0))
            .then(a.0 .1.cmp(&b.0 .1))
    });

    for ((code, jahr), row) in ordered {
        let mut record = vec![
            jahr.to_string(),
            code.to_string(),
            names.name_of(*code).unwrap_or("").to_string(),
        ];
        for cell in row {
            record.push(match cell {
                Some(value) => format_cell(*value),
                None => match policy {
                    MissingPolicy::ZeroFill => format_cell(0.0),
                    MissingPolicy::Drop => String::new(),
                },
            });
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().context("Failed to flush CSV writer")?;
    String::from_utf8(bytes).context("Master CSV was not valid UTF-8")
}

// =============================================================================
// Run Report
// =============================================================================

#[derive(Debug, Serialize)]
struct LayerReport {
    dataset_id: String,
    status: String,
    rows: usize,
    columns: usize,
    dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct MergeReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    source_dir: String,
    output: String,
    missing_policy: String,
    min_year: i32,
    municipalities_mapped: usize,
    master_rows: usize,
    master_columns: usize,
    branded_features: Vec<String>,
    layers: Vec<LayerReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::resolve(&args);

    println!("=== OGD BL Merger ===");
    println!("Source dir: {}", config.source_dir.display());
    println!("Output: {}", config.output.display());
    println!("Missing policy: {}", args.missing_policy.label());
    println!("Min year: {}", args.min_year);

    let started_at = Utc::now();
    let mut layer_reports = Vec::new();

    // Load every configured export up front; the same tables feed the
    // name-map pre-pass and the merge.
    let mut tables: Vec<(&LayerConfig, RawTable)> = Vec::new();
    for layer in LAYER_CONFIGS {
        let path = config.source_dir.join(format!("export_{}.csv", layer.id));
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("  ⚠ Layer {}: {} ({})", layer.id, path.display(), e);
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "missing".to_string(),
                    rows: 0,
                    columns: 0,
                    dropped: 0,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };
        match RawTable::from_csv(&decode_export(&bytes)) {
            Ok(table) if table.rows.is_empty() => {
                println!("  ⚠ Layer {}: export is empty", layer.id);
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "empty".to_string(),
                    rows: 0,
                    columns: table.headers.len(),
                    dropped: 0,
                    error: None,
                });
            }
            Ok(table) => tables.push((layer, table)),
            Err(e) => {
                eprintln!("  ✗ Layer {}: unreadable export: {}", layer.id, e);
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "unreadable".to_string(),
                    rows: 0,
                    columns: 0,
                    dropped: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    // Pre-pass: municipality number <-> name, read-only afterwards.
    let mut names = BfsNameMap::default();
    for (_, table) in &tables {
        names.scan_table(table, 100);
    }
    println!("\nBFS name map: {} municipalities", names.len());

    let mut master = MasterTable::default();
    let mut merged = 0;

    println!("\nMerging {} layer(s)...", tables.len());
    for (layer, table) in &tables {
        match normalize_layer(table, layer, &names, args.min_year, args.missing_policy) {
            Ok(normalized) if normalized.rows.is_empty() => {
                println!("  ⚠ Layer {}: no usable rows after cleaning", layer.id);
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "no-rows".to_string(),
                    rows: 0,
                    columns: 0,
                    dropped: normalized.dropped,
                    error: None,
                });
            }
            Ok(normalized) => {
                let wide = build_layer_table(layer.id, &normalized);
                println!(
                    "  ✓ Layer {}: {} keys x {} columns ({} rows dropped)",
                    layer.id,
                    wide.rows.len(),
                    wide.columns.len(),
                    normalized.dropped
                );
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "ok".to_string(),
                    rows: wide.rows.len(),
                    columns: wide.columns.len(),
                    dropped: normalized.dropped,
                    error: None,
                });
                master.merge_layer(wide);
                merged += 1;
            }
            Err(e) => {
                eprintln!("  ✗ Layer {}: {}", layer.id, e);
                layer_reports.push(LayerReport {
                    dataset_id: layer.id.to_string(),
                    status: "skipped".to_string(),
                    rows: 0,
                    columns: 0,
                    dropped: 0,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    master.sort_columns_by_dataset();
    let branded = apply_branded_features(&mut master);
    if !branded.is_empty() {
        println!("\nBranded features: {}", branded.join(", "));
    }

    let csv_text = render_master_csv(&master, &names, args.missing_policy)?;
    if let Some(parent) = config.output.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create output directory")?;
    }
    fs::write(&config.output, &csv_text)
        .await
        .context("Failed to write master table")?;

    let report = MergeReport {
        started_at,
        finished_at: Utc::now(),
        source_dir: config.source_dir.to_string_lossy().to_string(),
        output: config.output.to_string_lossy().to_string(),
        missing_policy: args.missing_policy.label().to_string(),
        min_year: args.min_year,
        municipalities_mapped: names.len(),
        master_rows: master.rows.len(),
        master_columns: master.columns.len() + 3,
        branded_features: branded,
        layers: layer_reports,
    };
    let report_path = config.output.with_extension("report.json");
    fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .await
        .context("Failed to write merge report")?;

    println!("\n=== Merge Summary ===");
    println!("Layers merged: {} / {}", merged, LAYER_CONFIGS.len());
    println!(
        "Master table: {} rows x {} columns",
        report.master_rows, report.master_columns
    );
    println!("Output: {}", config.output.display());
    println!("Report: {}", report_path.display());

    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================
