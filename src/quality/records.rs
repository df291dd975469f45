//! Derived quality records, one per processed trace.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trace::Spectrum;

/// Sample interval for window bucketing.
pub const BUCKET_SECONDS: i64 = 30;

/// Align a timestamp down to its 30-second bucket.
pub fn bucket_align(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(BUCKET_SECONDS);
    Utc.timestamp_opt(aligned, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Quality view of one trace. Exactly one per ingested trace; held in a
/// bounded ring where old records age out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRecord {
    pub trace_id: Uuid,
    pub model: String,
    pub spectrum: Spectrum,
    /// Normalized quality in [0, 1].
    pub score: f64,
    pub latency_ms: u64,
    pub cost_estimate: Decimal,
    /// 30-second-aligned bucket of the trace timestamp.
    pub window_bucket: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_align_floors_to_30s() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 42).unwrap();
        let bucket = bucket_align(ts);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 30).unwrap());
    }

    #[test]
    fn bucket_align_is_idempotent() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 17).unwrap();
        assert_eq!(bucket_align(bucket_align(ts)), bucket_align(ts));
    }

    #[test]
    fn aligned_timestamps_stay_put() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap();
        assert_eq!(bucket_align(ts), ts);
    }
}
