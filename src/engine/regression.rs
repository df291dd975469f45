//! Delta analysis: compare the live window against the baseline.

use serde::Serialize;

use super::stats::{SampleStats, welch_t_test};
use crate::error::CapabilityError;
use crate::quality::QualityWindow;
use crate::trace::Spectrum;

/// Minimum samples per window before a comparison is meaningful.
pub const MIN_WINDOW_SAMPLES: usize = 30;

#[derive(Debug, Clone)]
pub struct RegressionConfig {
    /// Minimum baseline-minus-live mean delta.
    pub min_delta: f64,
    /// Significance threshold for the Welch test.
    pub alpha: f64,
}

/// A detected regression.
#[derive(Debug, Clone, Serialize)]
pub struct RegressionAnalysis {
    /// `baseline_mean − live_mean`, positive means quality dropped.
    pub magnitude: f64,
    pub p_value: f64,
    pub affected_models: Vec<String>,
    pub affected_spectrums: Vec<Spectrum>,
}

/// Compare windows. Idempotent over the same pair of snapshots.
///
/// Signals a regression only when the mean dropped by at least
/// `min_delta` AND the drop is statistically significant.
pub fn detect(
    live: &QualityWindow,
    baseline: &QualityWindow,
    config: &RegressionConfig,
) -> Result<Option<RegressionAnalysis>, CapabilityError> {
    let have = live.count.min(baseline.count);
    if have < MIN_WINDOW_SAMPLES {
        return Err(CapabilityError::InsufficientData {
            needed: MIN_WINDOW_SAMPLES,
            have,
        });
    }

    let magnitude = baseline.mean - live.mean;
    if magnitude < config.min_delta {
        return Ok(None);
    }

    let live_stats = SampleStats {
        n: live.count,
        mean: live.mean,
        var: live.variance(),
    };
    let baseline_stats = SampleStats {
        n: baseline.count,
        mean: baseline.mean,
        var: baseline.variance(),
    };
    let Some(result) = welch_t_test(&baseline_stats, &live_stats) else {
        return Ok(None);
    };
    if result.p_value > config.alpha {
        return Ok(None);
    }

    // Per-group attribution: keys present in both windows whose mean
    // dropped by at least the configured delta.
    let affected_models = baseline
        .by_model
        .iter()
        .filter_map(|(model, baseline_mean)| {
            let live_mean = live.by_model.get(model)?;
            (baseline_mean - live_mean >= config.min_delta).then(|| model.clone())
        })
        .collect();
    let affected_spectrums = baseline
        .by_spectrum
        .iter()
        .filter_map(|(tag, baseline_mean)| {
            let live_mean = live.by_spectrum.get(tag)?;
            (baseline_mean - live_mean >= config.min_delta)
                .then(|| tag.parse::<Spectrum>().ok())
                .flatten()
        })
        .collect();

    Ok(Some(RegressionAnalysis {
        magnitude,
        p_value: result.p_value,
        affected_models,
        affected_spectrums,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn window(count: usize, mean: f64, stddev: f64) -> QualityWindow {
        QualityWindow {
            bucket_start: Utc::now(),
            duration: Duration::from_secs(3_600),
            count,
            mean,
            p50: mean,
            p95: mean,
            stddev,
            by_model: BTreeMap::new(),
            by_spectrum: BTreeMap::new(),
        }
    }

    fn config() -> RegressionConfig {
        RegressionConfig {
            min_delta: 0.05,
            alpha: 0.05,
        }
    }

    #[test]
    fn small_windows_are_insufficient() {
        let err = detect(&window(5, 0.8, 0.05), &window(500, 0.92, 0.05), &config()).unwrap_err();
        assert!(matches!(err, CapabilityError::InsufficientData { .. }));
    }

    #[test]
    fn no_signal_below_delta() {
        let result = detect(&window(200, 0.90, 0.05), &window(500, 0.92, 0.05), &config()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn clear_drop_is_detected() {
        let result = detect(&window(200, 0.85, 0.05), &window(500, 0.92, 0.05), &config())
            .unwrap()
            .expect("regression expected");
        assert!((result.magnitude - 0.07).abs() < 1e-12);
        assert!(result.p_value <= 0.05);
    }

    #[test]
    fn noisy_drop_below_significance_is_ignored() {
        // Same means but tiny samples and huge variance: not significant.
        let result = detect(&window(30, 0.86, 0.4), &window(30, 0.92, 0.4), &config()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn attribution_names_dropped_groups() {
        let mut live = window(200, 0.85, 0.05);
        let mut baseline = window(500, 0.92, 0.05);
        baseline.by_model.insert("gpt-4o-mini".into(), 0.93);
        live.by_model.insert("gpt-4o-mini".into(), 0.84);
        baseline.by_model.insert("stable-model".into(), 0.92);
        live.by_model.insert("stable-model".into(), 0.91);
        baseline.by_spectrum.insert("identity".into(), 0.94);
        live.by_spectrum.insert("identity".into(), 0.80);

        let result = detect(&live, &baseline, &config()).unwrap().unwrap();
        assert_eq!(result.affected_models, vec!["gpt-4o-mini".to_string()]);
        assert_eq!(result.affected_spectrums, vec![Spectrum::Identity]);
    }

    #[test]
    fn detection_is_idempotent() {
        let live = window(200, 0.85, 0.05);
        let baseline = window(500, 0.92, 0.05);
        let first = detect(&live, &baseline, &config()).unwrap().unwrap();
        let second = detect(&live, &baseline, &config()).unwrap().unwrap();
        assert_eq!(first.magnitude, second.magnitude);
        assert_eq!(first.p_value, second.p_value);
    }
}
