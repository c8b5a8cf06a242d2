//! Regression Service - Studies the master table with linear models
//!
//! Responsibilities:
//! - Read the master CSV and select the feature/target columns
//! - Drop unparseable rows and non-positive targets
//! - Report the Pearson correlation of the two columns
//! - Fit OLS, ridge and lasso on a seeded train/test split
//! - Tune the ridge/lasso alpha by 5-fold cross-validation
//! - Pick the best model by held-out R2 and run residual diagnostics
//! - Write predictions and the serialized best model
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same master table + same seed = same model and predictions
//!
//! Usage:
//!   cargo run --bin regression
//!   cargo run --bin regression -- --feature-column ds10680_endbestand --seed 7

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(name = "regression", about = "Fits linear models on two master-table columns")]
struct Args {
    /// Master table CSV (overrides MASTER_TABLE)
    #[arg(long)]
    input: Option<String>,

    /// Explanatory column
    #[arg(long, default_value = "ds10680_endbestand")]
    feature_column: String,

    /// Response column
    #[arg(long, default_value = "ds10200_quadratmeterpreis_chf")]
    target_column: String,

    /// Output path for the test-set predictions
    #[arg(long, default_value = "./data/predictions_regression.csv")]
    predictions_out: String,

    /// Output path for the serialized best model
    #[arg(long, default_value = "./data/best_model_regression.json")]
    model_out: String,

    /// Fraction of rows held out for evaluation
    #[arg(long, default_value = "0.2")]
    test_fraction: f64,

    /// Shuffle seed for the train/test split
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Alpha grid shared by the ridge and lasso searches.
const ALPHA_GRID: &[f64] = &[0.001, 0.01, 0.1, 1.0, 10.0, 100.0];

/// Folds for the cross-validated alpha search.
const CV_FOLDS: usize = 5;

// =============================================================================
// Data Loading
// =============================================================================

/// Extract the (feature, target) pairs from the master CSV. Rows where either
/// column fails to parse are dropped.
fn load_columns(content: &str, feature: &str, target: &str) -> Result<Vec<(f64, f64)>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let feature_idx = headers
        .iter()
        .position(|h| h == feature)
        .with_context(|| format!("Column not found: {}", feature))?;
    let target_idx = headers
        .iter()
        .position(|h| h == target)
        .with_context(|| format!("Column not found: {}", target))?;

    let mut data = Vec::new();
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(_) => continue,
        };
        let x = record.get(feature_idx).and_then(|v| v.parse::<f64>().ok());
        let y = record.get(target_idx).and_then(|v| v.parse::<f64>().ok());
        if let (Some(x), Some(y)) = (x, y) {
            data.push((x, y));
        }
    }
    Ok(data)
}

// =============================================================================
// Split and Folds
// =============================================================================

/// Seeded shuffle split. The test share is rounded up and clamped so both
/// sides stay non-empty.
fn train_test_split(
    data: &[(f64, f64)],
    test_fraction: f64,
    seed: u64,
) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
    if data.len() < 2 {
        return (data.to_vec(), Vec::new());
    }
    let mut indices: Vec<usize> = (0..data.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let test_len = ((data.len() as f64) * test_fraction).ceil() as usize;
    let test_len = test_len.clamp(1, data.len() - 1);

    let test = indices[..test_len].iter().map(|&i| data[i]).collect();
    let train = indices[test_len..].iter().map(|&i| data[i]).collect();
    (train, test)
}

/// Contiguous fold boundaries over n rows; earlier folds take the remainder.
fn kfold_bounds(n: usize, k: usize) -> Vec<(usize, usize)> {
    let base = n / k;
    let remainder = n % k;
    let mut bounds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let len = base + usize::from(fold < remainder);
        bounds.push((start, start + len));
        start += len;
    }
    bounds
}

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct LinearModel {
    coefficient: f64,
    intercept: f64,
}

impl LinearModel {
    fn predict(&self, x: f64) -> f64 {
        self.intercept + self.coefficient * x
    }
}

/// Solve a dense n x n system by Gaussian elimination with partial pivoting.
/// Returns None for a singular or ill-conditioned matrix.
fn gaussian_solve(mut a: Vec<f64>, mut b: Vec<f64>, n: usize) -> Option<Vec<f64>> {
    for i in 0..n {
        // Pivot on the largest remaining entry in column i
        let mut pivot = i;
        for r in (i + 1)..n {
            if a[r * n + i].abs() > a[pivot * n + i].abs() {
                pivot = r;
            }
        }
        if a[pivot * n + i] == 0.0 || !a[pivot * n + i].is_finite() {
            return None;
        }
        if pivot != i {
            for c in 0..n {
                a.swap(i * n + c, pivot * n + c);
            }
            b.swap(i, pivot);
        }

        let diag = a[i * n + i];
        for r in (i + 1)..n {
            let factor = a[r * n + i] / diag;
            if factor == 0.0 {
                continue;
            }
            a[r * n + i] = 0.0;
            for c in (i + 1)..n {
                a[r * n + c] -= factor * a[i * n + c];
            }
            b[r] -= factor * b[i];
        }
    }

    let mut x = vec![0.0f64; n];
    for i_rev in 0..n {
        let i = n - 1 - i_rev;
        let mut s = b[i];
        for c in (i + 1)..n {
            s -= a[i * n + c] * x[c];
        }
        let diag = a[i * n + i];
        if diag == 0.0 || !diag.is_finite() {
            return None;
        }
        x[i] = s / diag;
    }
    Some(x)
}

/// OLS / ridge via the normal equations. The penalty lands only on the
/// slope diagonal, so the intercept is never shrunk; lambda = 0 is plain
/// least squares.
fn fit_ridge(data: &[(f64, f64)], lambda: f64) -> Option<LinearModel> {
    if data.len() < 2 {
        return None;
    }
    let n = data.len() as f64;
    let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (x, y) in data {
        sx += x;
        sy += y;
        sxx += x * x;
        sxy += x * y;
    }

    // [[sxx + lambda, sx], [sx, n]] * [w, b] = [sxy, sy]
    let solution = gaussian_solve(vec![sxx + lambda, sx, sx, n], vec![sxy, sy], 2)?;
    Some(LinearModel {
        coefficient: solution[0],
        intercept: solution[1],
    })
}

fn fit_linear(data: &[(f64, f64)]) -> Option<LinearModel> {
    fit_ridge(data, 0.0)
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

/// Lasso with the (1/2n)·SSE + alpha·|w| objective and an unpenalized
/// intercept. With a single centered feature the coordinate-descent update
/// converges in one step.
fn fit_lasso(data: &[(f64, f64)], alpha: f64) -> Option<LinearModel> {
    if data.len() < 2 {
        return None;
    }
    let n = data.len() as f64;
    let x_mean = data.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = data.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx = data.iter().map(|(x, _)| (x - x_mean).powi(2)).sum::<f64>() / n;
    if sxx == 0.0 || !sxx.is_finite() {
        return None;
    }
    let rho = data
        .iter()
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum::<f64>()
        / n;

    let coefficient = soft_threshold(rho, alpha) / sxx;
    Some(LinearModel {
        coefficient,
        intercept: y_mean - coefficient * x_mean,
    })
}

// =============================================================================
// Evaluation
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
struct Metrics {
    rmse: f64,
    mae: f64,
    r2: f64,
}

fn evaluate(y_true: &[f64], y_pred: &[f64]) -> Metrics {
    let n = y_true.len() as f64;
    let mean: f64 = y_true.iter().sum::<f64>() / n;

    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let mae: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).abs())
        .sum::<f64>()
        / n;

    Metrics {
        rmse: (ss_res / n).sqrt(),
        mae,
        r2: if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 },
    }
}

fn pearson_r(data: &[(f64, f64)]) -> Option<f64> {
    if data.len() < 2 {
        return None;
    }
    let n = data.len() as f64;
    let x_mean = data.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = data.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxy: f64 = data
        .iter()
        .map(|(x, y)| (x - x_mean) * (y - y_mean))
        .sum();
    let sxx: f64 = data.iter().map(|(x, _)| (x - x_mean).powi(2)).sum();
    let syy: f64 = data.iter().map(|(_, y)| (y - y_mean).powi(2)).sum();
    if sxx == 0.0 || syy == 0.0 {
        return None;
    }
    Some(sxy / (sxx * syy).sqrt())
}

/// Mean R2 over k contiguous folds. None when no fold could be fitted.
fn cross_val_r2<F>(data: &[(f64, f64)], k: usize, fit: F) -> Option<f64>
where
    F: Fn(&[(f64, f64)]) -> Option<LinearModel>,
{
    if data.len() < k || k < 2 {
        return None;
    }
    let mut scores = Vec::with_capacity(k);
    for (start, end) in kfold_bounds(data.len(), k) {
        let holdout = &data[start..end];
        let fit_rows: Vec<(f64, f64)> = data[..start]
            .iter()
            .chain(data[end..].iter())
            .copied()
            .collect();
        let model = match fit(&fit_rows) {
            Some(model) => model,
            None => continue,
        };
        let y_true: Vec<f64> = holdout.iter().map(|(_, y)| *y).collect();
        let y_pred: Vec<f64> = holdout.iter().map(|(x, _)| model.predict(*x)).collect();
        scores.push(evaluate(&y_true, &y_pred).r2);
    }
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Pick the alpha with the best cross-validated R2, then refit on the full
/// training split.
fn grid_search<F>(train: &[(f64, f64)], fit: F) -> Option<(f64, f64, LinearModel)>
where
    F: Fn(&[(f64, f64)], f64) -> Option<LinearModel>,
{
    let mut best: Option<(f64, f64)> = None;
    for &alpha in ALPHA_GRID {
        let score = match cross_val_r2(train, CV_FOLDS, |rows| fit(rows, alpha)) {
            Some(score) => score,
            None => continue,
        };
        let better = match best {
            Some((_, best_score)) => score > best_score,
            None => true,
        };
        if better {
            best = Some((alpha, score));
        }
    }
    let (alpha, score) = best?;
    let model = fit(train, alpha)?;
    Some((alpha, score, model))
}

// =============================================================================
// Residual Diagnostics
// =============================================================================

/// Durbin-Watson statistic of the residual sequence.
fn durbin_watson(residuals: &[f64]) -> f64 {
    let ss: f64 = residuals.iter().map(|e| e * e).sum();
    if ss == 0.0 {
        return 0.0;
    }
    let diff_ss: f64 = residuals
        .windows(2)
        .map(|w| (w[1] - w[0]).powi(2))
        .sum();
    diff_ss / ss
}

/// Breusch-Pagan LM statistic: n times the R2 of regressing the squared
/// residuals on the feature. Reported without a p-value.
fn breusch_pagan_lm(features: &[f64], residuals: &[f64]) -> Option<f64> {
    let aux: Vec<(f64, f64)> = features
        .iter()
        .zip(residuals)
        .map(|(x, e)| (*x, e * e))
        .collect();
    let model = fit_linear(&aux)?;
    let y_true: Vec<f64> = aux.iter().map(|(_, y)| *y).collect();
    let y_pred: Vec<f64> = aux.iter().map(|(x, _)| model.predict(*x)).collect();
    let r2 = evaluate(&y_true, &y_pred).r2;
    Some(aux.len() as f64 * r2)
}

// =============================================================================
// Model Artifact
// =============================================================================

#[derive(Debug, Serialize)]
struct CandidateReport {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpha: Option<f64>,
    metrics: Metrics,
}

#[derive(Debug, Serialize)]
struct ModelArtifact {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpha: Option<f64>,
    coefficient: f64,
    intercept: f64,
    feature_column: String,
    target_column: String,
    metrics: Metrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pearson_r: Option<f64>,
    durbin_watson: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    breusch_pagan_lm: Option<f64>,
    train_rows: usize,
    test_rows: usize,
    seed: u64,
    candidates: Vec<CandidateReport>,
}

fn render_predictions(
    feature_column: &str,
    target_column: &str,
    test: &[(f64, f64)],
    model: &LinearModel,
) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        feature_column.to_string(),
        format!("y_true_{}", target_column),
        "y_pred".to_string(),
        "residual".to_string(),
    ])?;
    for (x, y) in test {
        let pred = model.predict(*x);
        writer.write_record([
            x.to_string(),
            y.to_string(),
            pred.to_string(),
            (y - pred).to_string(),
        ])?;
    }
    let bytes = writer.into_inner().context("Failed to flush CSV writer")?;
    String::from_utf8(bytes).context("Predictions CSV was not valid UTF-8")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let input = args
        .input
        .clone()
        .or_else(|| std::env::var("MASTER_TABLE").ok())
        .unwrap_or_else(|| "./data/master_table.csv".to_string());

    println!("=== OGD BL Regression ===");
    println!("Input: {}", input);
    println!("Feature: {}", args.feature_column);
    println!("Target: {}", args.target_column);

    let content = fs::read_to_string(&input)
        .await
        .with_context(|| format!("Failed to read master table: {}", input))?;

    let all_rows = load_columns(&content, &args.feature_column, &args.target_column)?;
    println!("\nRows with both columns numeric: {}", all_rows.len());

    // Zero or negative prices are placeholder cells, not observations.
    let data: Vec<(f64, f64)> = all_rows.into_iter().filter(|(_, y)| *y > 0.0).collect();
    println!("Rows with target > 0: {}", data.len());

    if data.len() < 10 {
        anyhow::bail!("Not enough usable rows to fit a model ({})", data.len());
    }

    let correlation = pearson_r(&data);
    if let Some(r) = correlation {
        println!("Pearson r: {:.4}", r);
    }

    let (train, test) = train_test_split(&data, args.test_fraction, args.seed);
    println!("Train size: {}, test size: {}", train.len(), test.len());

    let y_test: Vec<f64> = test.iter().map(|(_, y)| *y).collect();

    // Fixed-alpha models plus the cross-validated alpha searches
    let mut candidates: Vec<(String, Option<f64>, LinearModel)> = Vec::new();

    match fit_linear(&train) {
        Some(model) => {
            println!("\nLinear: intercept {:.4}, coef {:.6}", model.intercept, model.coefficient);
            candidates.push(("linear".to_string(), None, model));
        }
        None => eprintln!("  ✗ Linear fit failed (degenerate training data)"),
    }
    if let Some(model) = fit_ridge(&train, 1.0) {
        candidates.push(("ridge".to_string(), Some(1.0), model));
    }
    if let Some(model) = fit_lasso(&train, 0.1) {
        candidates.push(("lasso".to_string(), Some(0.1), model));
    }

    match grid_search(&train, fit_ridge) {
        Some((alpha, cv_r2, model)) => {
            println!("Ridge grid: best alpha {}, CV R2 {:.4}", alpha, cv_r2);
            candidates.push(("ridge_best".to_string(), Some(alpha), model));
        }
        None => println!("Ridge grid: skipped (not enough training rows)"),
    }
    match grid_search(&train, fit_lasso) {
        Some((alpha, cv_r2, model)) => {
            println!("Lasso grid: best alpha {}, CV R2 {:.4}", alpha, cv_r2);
            candidates.push(("lasso_best".to_string(), Some(alpha), model));
        }
        None => println!("Lasso grid: skipped (not enough training rows)"),
    }

    if candidates.is_empty() {
        anyhow::bail!("No model could be fitted");
    }

    // Evaluate every candidate on the held-out split
    println!("\nEvaluation (RMSE, MAE, R2):");
    let mut reports = Vec::new();
    for (name, alpha, model) in &candidates {
        let y_pred: Vec<f64> = test.iter().map(|(x, _)| model.predict(*x)).collect();
        let metrics = evaluate(&y_test, &y_pred);
        println!(
            "  {}: RMSE={:.2}, MAE={:.2}, R2={:.4}",
            name, metrics.rmse, metrics.mae, metrics.r2
        );
        reports.push(CandidateReport {
            name: name.clone(),
            alpha: *alpha,
            metrics,
        });
    }

    let best_idx = (0..candidates.len())
        .max_by(|&a, &b| {
            reports[a]
                .metrics
                .r2
                .partial_cmp(&reports[b].metrics.r2)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);
    let (best_name, best_alpha, best_model) = &candidates[best_idx];
    println!("\nBest model (by R2): {}", best_name);

    // Residual diagnostics on the winner
    let x_test: Vec<f64> = test.iter().map(|(x, _)| *x).collect();
    let residuals: Vec<f64> = test
        .iter()
        .map(|(x, y)| y - best_model.predict(*x))
        .collect();
    let dw = durbin_watson(&residuals);
    let bp = breusch_pagan_lm(&x_test, &residuals);
    println!("Durbin-Watson: {:.4}", dw);
    if let Some(lm) = bp {
        println!("Breusch-Pagan LM: {:.4}", lm);
    }

    let artifact = ModelArtifact {
        model: best_name.clone(),
        alpha: *best_alpha,
        coefficient: best_model.coefficient,
        intercept: best_model.intercept,
        feature_column: args.feature_column.clone(),
        target_column: args.target_column.clone(),
        metrics: reports[best_idx].metrics,
        pearson_r: correlation,
        durbin_watson: dw,
        breusch_pagan_lm: bp,
        train_rows: train.len(),
        test_rows: test.len(),
        seed: args.seed,
        candidates: reports,
    };

    let model_out = PathBuf::from(&args.model_out);
    if let Some(parent) = model_out.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create model output directory")?;
    }
    fs::write(&model_out, serde_json::to_string_pretty(&artifact)?)
        .await
        .context("Failed to write model artifact")?;
    println!("\nModel artifact: {}", model_out.display());

    let predictions = render_predictions(
        &args.feature_column,
        &args.target_column,
        &test,
        best_model,
    )?;
    let predictions_out = PathBuf::from(&args.predictions_out);
    if let Some(parent) = predictions_out.parent() {
        fs::create_dir_all(parent)
            .await
            .context("Failed to create predictions output directory")?;
    }
    fs::write(&predictions_out, predictions)
        .await
        .context("Failed to write predictions")?;
    println!("Predictions: {}", predictions_out.display());

    println!("\n=== Regression Complete ===");
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn line_data(slope: f64, intercept: f64, n: usize) -> Vec<(f64, f64)> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                (x, intercept + slope * x)
            })
            .collect()
    }

    fn assert_close(a: f64, b: f64, tolerance: f64) {
        assert!((a - b).abs() < tolerance, "{} != {} (tol {})", a, b, tolerance);
    }

    // -------------------------------------------------------------------------
    // DATA LOADING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_load_columns_selects_and_drops() {
        let csv = "jahr,ds10680_endbestand,ds10200_quadratmeterpreis_chf\n\
                   2020,100,950.5\n\
                   2021,,800\n\
                   2022,120,n/a\n\
                   2023,130,1000\n";
        let data =
            load_columns(csv, "ds10680_endbestand", "ds10200_quadratmeterpreis_chf").unwrap();
        assert_eq!(data, vec![(100.0, 950.5), (130.0, 1000.0)]);
    }

    #[test]
    fn test_load_columns_missing_column_is_an_error() {
        let csv = "jahr,wert\n2020,1\n";
        assert!(load_columns(csv, "ds10680_endbestand", "wert").is_err());
    }

    // -------------------------------------------------------------------------
    // SPLIT TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_split_sizes() {
        let data = line_data(1.0, 0.0, 10);
        let (train, test) = train_test_split(&data, 0.2, 42);
        assert_eq!(test.len(), 2);
        assert_eq!(train.len(), 8);
    }

    #[test]
    fn test_split_is_deterministic() {
        let data = line_data(2.0, 1.0, 20);
        let (train_a, test_a) = train_test_split(&data, 0.2, 42);
        let (train_b, test_b) = train_test_split(&data, 0.2, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);
    }

    #[test]
    fn test_split_differs_by_seed() {
        let data = line_data(2.0, 1.0, 50);
        let (_, test_a) = train_test_split(&data, 0.2, 1);
        let (_, test_b) = train_test_split(&data, 0.2, 2);
        assert_ne!(test_a, test_b);
    }

    #[test]
    fn test_split_partitions_all_rows() {
        let data = line_data(1.0, 0.0, 13);
        let (train, test) = train_test_split(&data, 0.25, 7);
        assert_eq!(train.len() + test.len(), 13);
    }

    #[test]
    fn test_kfold_bounds_cover_everything() {
        let bounds = kfold_bounds(13, 5);
        assert_eq!(bounds.len(), 5);
        assert_eq!(bounds[0], (0, 3));
        assert_eq!(bounds.last().unwrap().1, 13);
        let total: usize = bounds.iter().map(|(s, e)| e - s).sum();
        assert_eq!(total, 13);
    }

    // -------------------------------------------------------------------------
    // MODEL FIT TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_linear_recovers_exact_line() {
        let model = fit_linear(&line_data(2.0, 1.0, 30)).unwrap();
        assert_close(model.coefficient, 2.0, 1e-9);
        assert_close(model.intercept, 1.0, 1e-9);
    }

    #[test]
    fn test_linear_degenerate_feature_fails() {
        let data = vec![(5.0, 1.0), (5.0, 2.0), (5.0, 3.0)];
        assert!(fit_linear(&data).is_none());
    }

    #[test]
    fn test_ridge_zero_lambda_equals_ols() {
        let data = vec![(1.0, 2.1), (2.0, 3.9), (3.0, 6.2), (4.0, 8.1), (5.0, 9.8)];
        let ols = fit_linear(&data).unwrap();
        let ridge = fit_ridge(&data, 0.0).unwrap();
        assert_close(ols.coefficient, ridge.coefficient, 1e-9);
        assert_close(ols.intercept, ridge.intercept, 1e-9);
    }

    #[test]
    fn test_ridge_shrinks_slope() {
        let data = line_data(2.0, 1.0, 10);
        let ols = fit_linear(&data).unwrap();
        let ridge = fit_ridge(&data, 100.0).unwrap();
        assert!(ridge.coefficient.abs() < ols.coefficient.abs());
        assert!(ridge.coefficient > 0.0);
    }

    #[test]
    fn test_lasso_zero_alpha_equals_ols() {
        let data = vec![(1.0, 2.1), (2.0, 3.9), (3.0, 6.2), (4.0, 8.1), (5.0, 9.8)];
        let ols = fit_linear(&data).unwrap();
        let lasso = fit_lasso(&data, 0.0).unwrap();
        assert_close(ols.coefficient, lasso.coefficient, 1e-9);
        assert_close(ols.intercept, lasso.intercept, 1e-9);
    }

    #[test]
    fn test_lasso_large_alpha_zeroes_slope() {
        let data = line_data(2.0, 1.0, 10);
        let lasso = fit_lasso(&data, 1e9).unwrap();
        assert_eq!(lasso.coefficient, 0.0);
        // With a zero slope the intercept is the mean of y
        let y_mean: f64 = data.iter().map(|(_, y)| y).sum::<f64>() / data.len() as f64;
        assert_close(lasso.intercept, y_mean, 1e-9);
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(5.0, 2.0), 3.0);
        assert_eq!(soft_threshold(-5.0, 2.0), -3.0);
        assert_eq!(soft_threshold(1.5, 2.0), 0.0);
        assert_eq!(soft_threshold(-1.5, 2.0), 0.0);
    }

    #[test]
    fn test_gaussian_solve_known_system() {
        // 2x + y = 5, x + 3y = 10 -> x = 1, y = 3
        let solution = gaussian_solve(vec![2.0, 1.0, 1.0, 3.0], vec![5.0, 10.0], 2).unwrap();
        assert_close(solution[0], 1.0, 1e-9);
        assert_close(solution[1], 3.0, 1e-9);
    }

    #[test]
    fn test_gaussian_solve_singular_is_none() {
        assert!(gaussian_solve(vec![1.0, 2.0, 2.0, 4.0], vec![3.0, 6.0], 2).is_none());
    }

    #[test]
    fn test_gaussian_solve_pivots_on_zero_diagonal() {
        // 0x + y = 1, x + 0y = 2 needs a row swap
        let solution = gaussian_solve(vec![0.0, 1.0, 1.0, 0.0], vec![1.0, 2.0], 2).unwrap();
        assert_close(solution[0], 2.0, 1e-9);
        assert_close(solution[1], 1.0, 1e-9);
    }

    // -------------------------------------------------------------------------
    // EVALUATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_evaluate_perfect_prediction() {
        let y = vec![1.0, 2.0, 3.0];
        let metrics = evaluate(&y, &y);
        assert_eq!(metrics.rmse, 0.0);
        assert_eq!(metrics.mae, 0.0);
        assert_eq!(metrics.r2, 1.0);
    }

    #[test]
    fn test_evaluate_mean_prediction_has_zero_r2() {
        let y_true = vec![1.0, 2.0, 3.0];
        let y_pred = vec![2.0, 2.0, 2.0];
        let metrics = evaluate(&y_true, &y_pred);
        assert_close(metrics.r2, 0.0, 1e-9);
    }

    #[test]
    fn test_evaluate_known_errors() {
        let y_true = vec![0.0, 0.0, 0.0, 0.0];
        let y_pred = vec![1.0, -1.0, 1.0, -1.0];
        let metrics = evaluate(&y_true, &y_pred);
        assert_eq!(metrics.rmse, 1.0);
        assert_eq!(metrics.mae, 1.0);
    }

    #[test]
    fn test_pearson_perfect_correlation() {
        let data = line_data(3.0, -2.0, 10);
        assert_close(pearson_r(&data).unwrap(), 1.0, 1e-9);
        let inverse: Vec<(f64, f64)> = data.iter().map(|(x, y)| (*x, -y)).collect();
        assert_close(pearson_r(&inverse).unwrap(), -1.0, 1e-9);
    }

    #[test]
    fn test_pearson_degenerate_is_none() {
        let data = vec![(1.0, 5.0), (1.0, 5.0), (1.0, 5.0)];
        assert!(pearson_r(&data).is_none());
    }

    // -------------------------------------------------------------------------
    // CROSS-VALIDATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_cross_val_r2_on_clean_line() {
        let data = line_data(2.0, 1.0, 25);
        let score = cross_val_r2(&data, 5, fit_linear).unwrap();
        assert_close(score, 1.0, 1e-6);
    }

    #[test]
    fn test_cross_val_too_few_rows_is_none() {
        let data = line_data(2.0, 1.0, 3);
        assert!(cross_val_r2(&data, 5, fit_linear).is_none());
    }

    #[test]
    fn test_grid_search_returns_grid_alpha() {
        let data = line_data(2.0, 1.0, 40);
        let (alpha, cv_r2, model) = grid_search(&data, fit_ridge).unwrap();
        assert!(ALPHA_GRID.contains(&alpha));
        assert!(cv_r2 > 0.99);
        assert_close(model.coefficient, 2.0, 0.1);
    }

    #[test]
    fn test_grid_search_lasso_prefers_small_alpha_on_clean_data() {
        let data = line_data(2.0, 1.0, 40);
        let (alpha, _, model) = grid_search(&data, fit_lasso).unwrap();
        assert!(alpha <= 1.0);
        assert!(model.coefficient > 1.0);
    }

    // -------------------------------------------------------------------------
    // DIAGNOSTICS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_durbin_watson_alternating_residuals() {
        // Strong negative autocorrelation pushes the statistic toward 4
        let residuals = vec![1.0, -1.0, 1.0, -1.0];
        assert_eq!(durbin_watson(&residuals), 3.0);
    }

    #[test]
    fn test_durbin_watson_zero_residuals() {
        assert_eq!(durbin_watson(&[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_breusch_pagan_homoscedastic_is_near_zero() {
        let features = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let residuals = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let lm = breusch_pagan_lm(&features, &residuals).unwrap();
        assert_close(lm, 0.0, 1e-9);
    }

    // -------------------------------------------------------------------------
    // OUTPUT TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_render_predictions_layout() {
        let model = LinearModel {
            coefficient: 2.0,
            intercept: 1.0,
        };
        let test = vec![(1.0, 3.0), (2.0, 6.0)];
        let csv = render_predictions("ds10680_endbestand", "ds10200_quadratmeterpreis_chf", &test, &model)
            .unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "ds10680_endbestand,y_true_ds10200_quadratmeterpreis_chf,y_pred,residual"
        );
        assert_eq!(lines[1], "1,3,3,0");
        assert_eq!(lines[2], "2,6,5,1");
    }
}
