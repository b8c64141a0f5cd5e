pub mod backend;
pub mod calibration;
pub mod circadian;
pub mod config;
pub mod device;
pub mod epochs;
pub mod imputation;
pub mod metrics;
pub mod nonwear;
pub mod output;
pub mod sleep;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the engine. Algorithmic "could not compute
/// confidently" outcomes (e.g. calibration rejection) are not errors;
/// they come back as data with a success flag and a diagnostic string.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("unsupported or corrupt container {}: {detail}", path.display())]
    Format { path: PathBuf, detail: String },

    #[error("backend '{backend}' does not support {capability:?}")]
    Unsupported {
        backend: &'static str,
        capability: backend::Capability,
    },

    #[error("unknown backend id '{0}'")]
    UnknownBackend(String),

    #[error("backend '{0}' is registered but unavailable")]
    BackendUnavailable(String),

    #[error("no backends available")]
    NoBackends,

    #[error("backend id '{0}' is already registered")]
    DuplicateBackend(String),

    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("not enough samples: {got} sample(s), need at least {need}")]
    NotEnoughSamples { got: usize, need: usize },

    #[error("empty input for {0}")]
    EmptyInput(&'static str),

    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Device metadata decoded from the container's info record.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceMetadata {
    pub serial: String,
    pub device_type: String,
    pub sample_rate: f64,
    pub start_time: DateTime<Utc>,
    pub timezone_offset_minutes: i32,
    pub acceleration_scale: f64,
    pub sample_count: Option<u64>,
}

/// Raw tri-axial samples in g with per-sample timestamps in Unix
/// milliseconds. The four parallel arrays are always equal length.
#[derive(Debug, Clone)]
pub struct RawSampleSet {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub timestamps: Vec<i64>,
    pub sample_rate: f64,
    pub metadata: Option<DeviceMetadata>,
    pub light: Option<Vec<f64>>,
    pub battery: Option<Vec<f64>>,
    pub wear: Option<Vec<bool>>,
}

impl RawSampleSet {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Nominal gap between consecutive samples in milliseconds.
    pub fn sample_period_ms(&self) -> f64 {
        1000.0 / self.sample_rate
    }
}

/// A named per-sample or per-epoch numeric series, with the parameters
/// that produced it carried along for reproducibility.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSeries {
    pub name: String,
    pub values: Vec<f64>,
    pub timestamps: Option<Vec<i64>>,
    pub params: serde_json::Value,
}

/// Per-epoch sleep/wake classification, 1 = sleep.
#[derive(Debug, Clone, Serialize)]
pub struct SleepScoreSeries {
    pub scores: Vec<u8>,
    pub algorithm: String,
    pub confidence: Option<Vec<f64>>,
    pub params: serde_json::Value,
}

/// A detected sleep window with derived summary statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SleepWindow {
    pub onset_index: usize,
    pub offset_index: usize,
    pub onset: DateTime<Utc>,
    pub offset: DateTime<Utc>,
    pub minutes_asleep: f64,
    pub minutes_awake_after_onset: f64,
    pub efficiency_percent: f64,
    pub method: String,
}

/// Boolean nonwear classification plus the contiguous index ranges it
/// implies. `ranges` entries are inclusive (start, end) index pairs.
#[derive(Debug, Clone, Serialize)]
pub struct NonwearSeries {
    pub flags: Vec<bool>,
    pub ranges: Vec<(usize, usize)>,
    pub algorithm: String,
    pub params: serde_json::Value,
}

impl NonwearSeries {
    /// Derive contiguous true-runs from a flag vector.
    pub fn ranges_from_flags(flags: &[bool]) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut start = None;
        for (i, &f) in flags.iter().enumerate() {
            match (f, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    ranges.push((s, i - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push((s, flags.len() - 1));
        }
        ranges
    }
}

/// Named scalar circadian statistics (window starts, means, amplitude,
/// variability indices).
#[derive(Debug, Clone, Serialize)]
pub struct CircadianMetrics {
    pub values: BTreeMap<String, f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_from_flags_finds_runs() {
        let flags = [false, true, true, false, true];
        let ranges = NonwearSeries::ranges_from_flags(&flags);
        assert_eq!(ranges, vec![(1, 2), (4, 4)]);
    }

    #[test]
    fn ranges_from_flags_empty_and_all_true() {
        assert!(NonwearSeries::ranges_from_flags(&[]).is_empty());
        assert_eq!(
            NonwearSeries::ranges_from_flags(&[true, true, true]),
            vec![(0, 2)]
        );
    }
}
