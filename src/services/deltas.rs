use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::services::series_store::Sample;

/// Bytes per gigabyte used for every derived GB figure.
///
/// Binary gigabytes (GiB) are used throughout; the raw byte counters are always
/// carried alongside so a decimal rendering can be derived by a consumer.
pub const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Fractional digits used when GB values are rendered as text.
pub const GB_DISPLAY_PRECISION: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaRow {
    pub timestamp: DateTime<Utc>,
    pub paid_bytes: i64,
    pub unpaid_bytes: i64,
    pub paid_gb: f64,
    pub unpaid_gb: f64,
    pub delta_unpaid_bytes: i64,
    pub delta_unpaid_gb: f64,
}

pub fn bytes_to_gb(bytes: i64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

pub fn format_gb(value: f64) -> String {
    format!("{value:.prec$}", prec = GB_DISPLAY_PRECISION)
}

/// Derives one row per sample, each relative to the sample stored immediately before it.
///
/// Counter resets on the remote side show up as negative deltas and are kept as-is.
pub fn compute(series: &[Sample]) -> Vec<DeltaRow> {
    let mut previous: Option<&Sample> = None;
    series
        .iter()
        .map(|sample| {
            let delta_unpaid_bytes = previous
                .map(|prev| sample.unpaid_bytes.saturating_sub(prev.unpaid_bytes))
                .unwrap_or(0);
            previous = Some(sample);
            DeltaRow {
                timestamp: sample.timestamp,
                paid_bytes: sample.paid_bytes,
                unpaid_bytes: sample.unpaid_bytes,
                paid_gb: bytes_to_gb(sample.paid_bytes),
                unpaid_gb: bytes_to_gb(sample.unpaid_bytes),
                delta_unpaid_bytes,
                delta_unpaid_gb: bytes_to_gb(delta_unpaid_bytes),
            }
        })
        .collect()
}
