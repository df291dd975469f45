//! Predictive quality management: a three-model ensemble over the
//! hourly quality series.
//!
//! Each member is a pure function from a numeric series to point
//! forecasts; the ensemble weights members by inverse validation MAPE on
//! a holdout split and produces an 80% central interval from the
//! ensemble's holdout residuals. Everything here is deterministic.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CapabilityError;

/// Seasonal period in hours.
const SEASON: usize = 24;

/// Two-sided 80% central interval z-score.
const Z_80: f64 = 1.2816;

/// Holt smoothing parameters (level, trend).
const HOLT_ALPHA: f64 = 0.3;
const HOLT_BETA: f64 = 0.1;

/// Maximum autoregressive order.
const AR_MAX_ORDER: usize = 4;

/// One forecast step.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastPoint {
    pub horizon_hours: u32,
    pub mean: f64,
    pub lower_80: f64,
    pub upper_80: f64,
    pub generated_at: DateTime<Utc>,
}

/// Forecast the series `horizon_hours` ahead in 1-hour steps.
///
/// Requires at least `min_samples` observations; below that the
/// capability returns `InsufficientData` and the caller no-ops.
pub fn forecast(
    series: &[f64],
    horizon_hours: u32,
    min_samples: usize,
) -> Result<Vec<ForecastPoint>, CapabilityError> {
    if series.len() < min_samples {
        return Err(CapabilityError::InsufficientData {
            needed: min_samples,
            have: series.len(),
        });
    }

    let horizon = horizon_hours.max(1) as usize;
    let holdout_len = (series.len() / 4).clamp(4, SEASON);
    let split = series.len() - holdout_len;
    let (train, holdout) = series.split_at(split);

    // Fit each member on the training prefix and score it on the holdout.
    let members: [fn(&[f64], usize) -> Vec<f64>; 3] =
        [linear_trend_forecast, holt_forecast, ar_forecast];
    let holdout_preds: Vec<Vec<f64>> = members.iter().map(|m| m(train, holdout_len)).collect();
    let weights = inverse_mape_weights(&holdout_preds, holdout);

    // Residual spread of the weighted ensemble on the holdout drives the
    // interval width.
    let sigma = {
        let mut sum_sq = 0.0;
        for (h, actual) in holdout.iter().enumerate() {
            let blended: f64 = weights
                .iter()
                .zip(&holdout_preds)
                .map(|(w, preds)| w * preds[h])
                .sum();
            sum_sq += (actual - blended).powi(2);
        }
        (sum_sq / holdout_len as f64).sqrt()
    };

    // Refit on the full series for the real forecast.
    let future_preds: Vec<Vec<f64>> = members.iter().map(|m| m(series, horizon)).collect();
    let generated_at = Utc::now();

    Ok((1..=horizon)
        .map(|h| {
            let blended: f64 = weights
                .iter()
                .zip(&future_preds)
                .map(|(w, preds)| w * preds[h - 1])
                .sum();
            let mean = blended.clamp(0.0, 1.0);
            let half_width = Z_80 * sigma * (h as f64).sqrt();
            ForecastPoint {
                horizon_hours: h as u32,
                mean,
                lower_80: (mean - half_width).clamp(0.0, 1.0),
                upper_80: (mean + half_width).clamp(0.0, 1.0),
                generated_at,
            }
        })
        .collect())
}

/// Mean absolute percentage error as a fraction.
pub fn mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return f64::INFINITY;
    }
    actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p).abs() / a.abs().max(1e-6))
        .sum::<f64>()
        / n as f64
}

fn inverse_mape_weights(predictions: &[Vec<f64>], actual: &[f64]) -> Vec<f64> {
    let raw: Vec<f64> = predictions
        .iter()
        .map(|preds| 1.0 / (mape(actual, preds) + 1e-3))
        .collect();
    let total: f64 = raw.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return vec![1.0 / predictions.len() as f64; predictions.len()];
    }
    raw.into_iter().map(|w| w / total).collect()
}

/// Member (a): linear trend fitted to seasonality-removed residuals.
fn linear_trend_forecast(series: &[f64], horizon: usize) -> Vec<f64> {
    let n = series.len();
    let overall = series.iter().sum::<f64>() / n as f64;

    // Hour-of-cycle profile; zero when fewer than two full seasons.
    let seasonal: Vec<f64> = if n >= 2 * SEASON {
        let mut sums = vec![0.0; SEASON];
        let mut counts = vec![0usize; SEASON];
        for (t, value) in series.iter().enumerate() {
            sums[t % SEASON] += value - overall;
            counts[t % SEASON] += 1;
        }
        sums.iter()
            .zip(&counts)
            .map(|(s, c)| if *c == 0 { 0.0 } else { s / *c as f64 })
            .collect()
    } else {
        vec![0.0; SEASON]
    };

    // OLS on the deseasonalized series.
    let mean_t = (n as f64 - 1.0) / 2.0;
    let mut cov = 0.0;
    let mut var_t = 0.0;
    let mut mean_x = 0.0;
    for (t, value) in series.iter().enumerate() {
        mean_x += value - seasonal[t % SEASON];
    }
    mean_x /= n as f64;
    for (t, value) in series.iter().enumerate() {
        let x = value - seasonal[t % SEASON];
        cov += (t as f64 - mean_t) * (x - mean_x);
        var_t += (t as f64 - mean_t).powi(2);
    }
    let slope = if var_t > 0.0 { cov / var_t } else { 0.0 };
    let intercept = mean_x - slope * mean_t;

    (0..horizon)
        .map(|h| {
            let t = n + h;
            intercept + slope * t as f64 + seasonal[t % SEASON]
        })
        .collect()
}

/// Member (b): Holt's linear exponential smoothing (level + trend).
fn holt_forecast(series: &[f64], horizon: usize) -> Vec<f64> {
    let mut level = series[0];
    let mut trend = if series.len() >= 2 {
        series[1] - series[0]
    } else {
        0.0
    };
    for value in &series[1..] {
        let next_level = HOLT_ALPHA * value + (1.0 - HOLT_ALPHA) * (level + trend);
        trend = HOLT_BETA * (next_level - level) + (1.0 - HOLT_BETA) * trend;
        level = next_level;
    }
    (1..=horizon).map(|h| level + h as f64 * trend).collect()
}

/// Member (c): autoregressive model of order ≤ 4, fit by least squares.
fn ar_forecast(series: &[f64], horizon: usize) -> Vec<f64> {
    let n = series.len();
    let p = (n / 10).clamp(1, AR_MAX_ORDER);
    if n <= p + 1 {
        let last = series[n - 1];
        return vec![last; horizon];
    }

    // Normal equations for y[t] = c + Σ a_i·y[t−i], ridge-stabilized.
    let dim = p + 1;
    let mut ata = vec![vec![0.0f64; dim]; dim];
    let mut atb = vec![0.0f64; dim];
    for t in p..n {
        let mut row = vec![1.0f64];
        for i in 1..=p {
            row.push(series[t - i]);
        }
        for (j, rj) in row.iter().enumerate() {
            atb[j] += rj * series[t];
            for (k, rk) in row.iter().enumerate() {
                ata[j][k] += rj * rk;
            }
        }
    }
    for (j, row) in ata.iter_mut().enumerate() {
        row[j] += 1e-8;
    }

    let Some(coeffs) = solve(ata, atb) else {
        let last = series[n - 1];
        return vec![last; horizon];
    };

    // Recursive prediction over an extended history.
    let mut history: Vec<f64> = series.to_vec();
    let mut out = Vec::with_capacity(horizon);
    for _ in 0..horizon {
        let len = history.len();
        let mut next = coeffs[0];
        for i in 1..=p {
            next += coeffs[i] * history[len - i];
        }
        out.push(next);
        history.push(next);
    }
    out
}

/// Gaussian elimination with partial pivoting for the small AR system.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in (row + 1)..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}
