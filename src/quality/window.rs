//! Rolling-window aggregates: Welford mean/variance plus reservoir
//! quantiles.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use super::records::QualityRecord;

/// Reservoir size for quantile estimation.
const RESERVOIR_CAP: usize = 512;

/// Welford online mean/variance accumulator.
#[derive(Debug, Clone, Default)]
pub(crate) struct Welford {
    count: usize,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n − 1 denominator).
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Algorithm-R reservoir sample.
struct Reservoir {
    samples: Vec<f64>,
    seen: usize,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: Vec::with_capacity(RESERVOIR_CAP),
            seen: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < RESERVOIR_CAP {
            self.samples.push(value);
        } else {
            let idx = rand::thread_rng().gen_range(0..self.seen);
            if idx < RESERVOIR_CAP {
                self.samples[idx] = value;
            }
        }
    }

    fn quantile(&self, q: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((sorted.len() as f64) * q).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

/// Aggregate view over one rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct QualityWindow {
    pub bucket_start: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub stddev: f64,
    /// Mean score per model.
    pub by_model: BTreeMap<String, f64>,
    /// Mean score per spectrum (canonical tag string).
    pub by_spectrum: BTreeMap<String, f64>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl QualityWindow {
    /// Compute aggregates over an iterator of records already filtered to
    /// the window.
    pub fn compute<'a>(
        records: impl Iterator<Item = &'a QualityRecord>,
        bucket_start: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let mut overall = Welford::default();
        let mut reservoir = Reservoir::new();
        let mut by_model: BTreeMap<String, Welford> = BTreeMap::new();
        let mut by_spectrum: BTreeMap<String, Welford> = BTreeMap::new();

        for record in records {
            overall.push(record.score);
            reservoir.push(record.score);
            by_model
                .entry(record.model.clone())
                .or_default()
                .push(record.score);
            by_spectrum
                .entry(record.spectrum.as_str().to_string())
                .or_default()
                .push(record.score);
        }

        QualityWindow {
            bucket_start,
            duration,
            count: overall.count(),
            mean: overall.mean(),
            p50: reservoir.quantile(0.50),
            p95: reservoir.quantile(0.95),
            stddev: overall.stddev(),
            by_model: by_model.into_iter().map(|(k, w)| (k, w.mean())).collect(),
            by_spectrum: by_spectrum
                .into_iter()
                .map(|(k, w)| (k, w.mean()))
                .collect(),
        }
    }

    /// Sample variance reconstructed from the stored stddev.
    pub fn variance(&self) -> f64 {
        self.stddev * self.stddev
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;
    use crate::quality::records::bucket_align;
    use crate::trace::Spectrum;

    fn record(model: &str, spectrum: Spectrum, score: f64) -> QualityRecord {
        let now = Utc::now();
        QualityRecord {
            trace_id: Uuid::new_v4(),
            model: model.to_string(),
            spectrum,
            score,
            latency_ms: 100,
            cost_estimate: Decimal::ZERO,
            window_bucket: bucket_align(now),
            timestamp: now,
        }
    }

    #[test]
    fn welford_matches_naive_stats() {
        let values = [0.8, 0.9, 0.85, 0.95, 0.7];
        let mut welford = Welford::default();
        for v in values {
            welford.push(v);
        }
        let naive_mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!((welford.mean() - naive_mean).abs() < 1e-12);

        let naive_var = values
            .iter()
            .map(|v| (v - naive_mean).powi(2))
            .sum::<f64>()
            / (values.len() - 1) as f64;
        assert!((welford.variance() - naive_var).abs() < 1e-12);
    }

    #[test]
    fn welford_small_samples_have_zero_variance() {
        let mut welford = Welford::default();
        assert_eq!(welford.variance(), 0.0);
        welford.push(0.5);
        assert_eq!(welford.variance(), 0.0);
    }

    #[test]
    fn window_groups_by_model_and_spectrum() {
        let records = vec![
            record("a", Spectrum::Identity, 0.9),
            record("a", Spectrum::Financial, 0.7),
            record("b", Spectrum::Identity, 0.5),
        ];
        let window = QualityWindow::compute(
            records.iter(),
            bucket_align(Utc::now()),
            Duration::from_secs(3_600),
        );
        assert_eq!(window.count, 3);
        assert!((window.by_model["a"] - 0.8).abs() < 1e-12);
        assert!((window.by_model["b"] - 0.5).abs() < 1e-12);
        assert!((window.by_spectrum["identity"] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn empty_window_is_all_zeroes() {
        let window = QualityWindow::compute(
            std::iter::empty(),
            bucket_align(Utc::now()),
            Duration::from_secs(3_600),
        );
        assert_eq!(window.count, 0);
        assert_eq!(window.mean, 0.0);
        assert_eq!(window.p95, 0.0);
    }

    #[test]
    fn reservoir_quantiles_on_small_samples_are_exact() {
        let mut reservoir = Reservoir::new();
        for i in 1..=100 {
            reservoir.push(f64::from(i));
        }
        assert_eq!(reservoir.quantile(0.5), 50.0);
        assert_eq!(reservoir.quantile(0.95), 95.0);
    }

    #[test]
    fn reservoir_stays_bounded() {
        let mut reservoir = Reservoir::new();
        for i in 0..10_000 {
            reservoir.push(f64::from(i));
        }
        assert_eq!(reservoir.samples.len(), RESERVOIR_CAP);
    }
}
