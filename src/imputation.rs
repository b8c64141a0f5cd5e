use crate::RawSampleSet;
use log::debug;
use serde::Serialize;

/// Default slack, in milliseconds, beyond one sample period before a
/// timestamp jump counts as a recording gap.
pub const DEFAULT_TOLERANCE_MS: f64 = 1000.0;

/// Gap-filled arrays plus the statistics the caller attaches to its own
/// output record. With zero gaps the arrays equal the input exactly.
#[derive(Debug, Clone, Serialize)]
pub struct ImputationOutcome {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub timestamps: Vec<i64>,
    pub gap_count: usize,
    pub samples_added: usize,
    pub gap_seconds: f64,
}

/// Fill recording gaps by replicating the last known sample.
///
/// Replication (not interpolation, not zero-fill) is the contract: it
/// matches GGIR's time-gap imputation, so nonwear and sleep detection
/// downstream stay numerically comparable with that tool's output.
pub fn impute_gaps(raw: &RawSampleSet, tolerance_ms: f64) -> ImputationOutcome {
    let period = raw.sample_period_ms();
    let n = raw.len();

    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);
    let mut timestamps = Vec::with_capacity(n);

    let mut gap_count = 0usize;
    let mut samples_added = 0usize;
    let mut gap_ms = 0.0f64;

    for i in 0..n {
        if i > 0 {
            let delta = (raw.timestamps[i] - raw.timestamps[i - 1]) as f64;
            if delta > period + tolerance_ms {
                // Rows are replicated from the last seen sample, with
                // evenly spaced synthesized timestamps.
                let missing = ((delta / period).round() as usize).saturating_sub(1);
                let last_ts = raw.timestamps[i - 1];
                for k in 1..=missing {
                    x.push(raw.x[i - 1]);
                    y.push(raw.y[i - 1]);
                    z.push(raw.z[i - 1]);
                    timestamps.push(last_ts + (k as f64 * period).round() as i64);
                }
                gap_count += 1;
                samples_added += missing;
                gap_ms += delta - period;
            }
        }
        x.push(raw.x[i]);
        y.push(raw.y[i]);
        z.push(raw.z[i]);
        timestamps.push(raw.timestamps[i]);
    }

    if gap_count > 0 {
        debug!(
            "imputed {} gap(s): {} samples added, {:.1}s missing",
            gap_count,
            samples_added,
            gap_ms / 1000.0
        );
    }

    ImputationOutcome {
        x,
        y,
        z,
        timestamps,
        gap_count,
        samples_added,
        gap_seconds: gap_ms / 1000.0,
    }
}

/// Fold an imputation outcome back into a sample set for the next stage.
pub fn to_sample_set(outcome: &ImputationOutcome, raw: &RawSampleSet) -> RawSampleSet {
    RawSampleSet {
        x: outcome.x.clone(),
        y: outcome.y.clone(),
        z: outcome.z.clone(),
        timestamps: outcome.timestamps.clone(),
        sample_rate: raw.sample_rate,
        metadata: raw.metadata.clone(),
        // Aux channels are not gap-filled; they keep their own cadence.
        light: raw.light.clone(),
        battery: raw.battery.clone(),
        wear: raw.wear.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set(timestamps: Vec<i64>, rate: f64) -> RawSampleSet {
        let n = timestamps.len();
        RawSampleSet {
            x: (0..n).map(|i| i as f64 * 0.1).collect(),
            y: vec![0.0; n],
            z: vec![1.0; n],
            timestamps,
            sample_rate: rate,
            metadata: None,
            light: None,
            battery: None,
            wear: None,
        }
    }

    #[test]
    fn no_gaps_returns_input_exactly() {
        let raw = sample_set(vec![0, 100, 200, 300], 10.0);
        let out = impute_gaps(&raw, DEFAULT_TOLERANCE_MS);
        assert_eq!(out.gap_count, 0);
        assert_eq!(out.samples_added, 0);
        assert_eq!(out.timestamps, raw.timestamps);
        assert_eq!(out.x, raw.x);
        assert_eq!(out.y, raw.y);
        assert_eq!(out.z, raw.z);
    }

    #[test]
    fn fills_a_gap_by_replication() {
        // 10 Hz; the 2000ms jump hides 19 missing rows.
        let raw = sample_set(vec![0, 100, 2100, 2200], 10.0);
        let out = impute_gaps(&raw, DEFAULT_TOLERANCE_MS);
        assert_eq!(out.gap_count, 1);
        assert_eq!(out.samples_added, 19);
        assert_eq!(out.timestamps.len(), raw.len() + 19);

        // Filled rows replicate the last sample before the gap.
        assert!((out.x[2] - raw.x[1]).abs() < 1e-12);
        assert!((out.x[20] - raw.x[1]).abs() < 1e-12);
        // Synthesized timestamps are evenly spaced at the sample period.
        assert_eq!(out.timestamps[2], 200);
        assert_eq!(out.timestamps[3], 300);
        assert_eq!(out.timestamps[20], 2000);
        assert_eq!(out.timestamps[21], 2100);
        assert!((out.gap_seconds - 1.9).abs() < 1e-9);
    }

    #[test]
    fn short_jitter_within_tolerance_is_not_a_gap() {
        // 500ms late is within the 1s tolerance at 10 Hz.
        let raw = sample_set(vec![0, 100, 700, 800], 10.0);
        let out = impute_gaps(&raw, DEFAULT_TOLERANCE_MS);
        assert_eq!(out.gap_count, 0);
        assert_eq!(out.timestamps, raw.timestamps);
    }

    #[test]
    fn never_shrinks() {
        let raw = sample_set(vec![0, 100, 5000, 5100, 20000], 10.0);
        let out = impute_gaps(&raw, DEFAULT_TOLERANCE_MS);
        assert!(out.timestamps.len() >= raw.len());
        assert_eq!(out.gap_count, 2);
    }
}
