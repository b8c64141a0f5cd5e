use crate::{EngineError, NonwearSeries, RawSampleSet};
use log::debug;
use serde_json::json;

/// Named parameter set for the raw-signal detector. Thresholds are
/// deliberately swappable presets; the literature does not agree on one
/// set of constants.
#[derive(Debug, Clone)]
pub struct SignalNonwearParams {
    pub preset: &'static str,
    pub window_minutes: f64,
    pub step_minutes: f64,
    pub sd_threshold_g: f64,
    pub range_threshold_g: f64,
    pub min_axes: usize,
}

impl SignalNonwearParams {
    pub fn preset(name: &str) -> Result<Self, EngineError> {
        match name {
            "default" => Ok(Self {
                preset: "default",
                window_minutes: 60.0,
                step_minutes: 15.0,
                sd_threshold_g: 0.013,
                range_threshold_g: 0.15,
                min_axes: 2,
            }),
            "strict" => Ok(Self {
                preset: "strict",
                window_minutes: 30.0,
                step_minutes: 15.0,
                sd_threshold_g: 0.013,
                range_threshold_g: 0.05,
                min_axes: 3,
            }),
            other => Err(EngineError::UnknownAlgorithm(format!(
                "nonwear preset '{}'",
                other
            ))),
        }
    }
}

fn axis_sd_and_range(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    (var.sqrt(), max - min)
}

/// Variance/range heuristic on the raw axes. One flag per step block;
/// each block is judged over the longer window around it so brief still
/// moments inside a worn period do not flip.
pub fn detect_signal_nonwear(
    raw: &RawSampleSet,
    params: &SignalNonwearParams,
) -> Result<NonwearSeries, EngineError> {
    let step = (raw.sample_rate * params.step_minutes * 60.0).round() as usize;
    let window = (raw.sample_rate * params.window_minutes * 60.0).round() as usize;
    if step == 0 || raw.len() < window {
        return Err(EngineError::NotEnoughSamples {
            got: raw.len(),
            need: window.max(1),
        });
    }

    let n_blocks = raw.len() / step;
    let mut flags = Vec::with_capacity(n_blocks);
    for b in 0..n_blocks {
        let center = b * step + step / 2;
        let lo = center.saturating_sub(window / 2);
        let hi = (lo + window).min(raw.len());
        let lo = hi.saturating_sub(window);

        let mut still_axes = 0;
        for axis in [&raw.x, &raw.y, &raw.z] {
            let (sd, range) = axis_sd_and_range(&axis[lo..hi]);
            if sd < params.sd_threshold_g && range < params.range_threshold_g {
                still_axes += 1;
            }
        }
        flags.push(still_axes >= params.min_axes);
    }

    let ranges = NonwearSeries::ranges_from_flags(&flags);
    debug!(
        "signal nonwear ({}): {} of {} blocks flagged",
        params.preset,
        flags.iter().filter(|&&f| f).count(),
        flags.len()
    );
    Ok(NonwearSeries {
        flags,
        ranges,
        algorithm: "stddev-range".to_string(),
        params: json!({
            "preset": params.preset,
            "window_minutes": params.window_minutes,
            "step_minutes": params.step_minutes,
            "sd_threshold_g": params.sd_threshold_g,
            "range_threshold_g": params.range_threshold_g,
            "min_axes": params.min_axes,
            "unit": "step-block",
        }),
    })
}

/// Parameters for the count-threshold detector on epoch counts.
#[derive(Debug, Clone)]
pub struct CountNonwearParams {
    /// Minimum run length, in epochs, for a nonwear interval.
    pub min_run_epochs: usize,
    /// Epochs of small nonzero activity tolerated inside a run.
    pub spike_tolerance: usize,
    /// Counts at or above this end a run regardless of tolerance.
    pub spike_max_count: f64,
}

impl Default for CountNonwearParams {
    fn default() -> Self {
        Self {
            min_run_epochs: 90,
            spike_tolerance: 2,
            spike_max_count: 100.0,
        }
    }
}

/// Fixed activity-count-threshold heuristic: long runs of zero-count
/// epochs, tolerating a couple of small spikes, are nonwear.
pub fn detect_count_nonwear(
    counts: &[f64],
    params: &CountNonwearParams,
) -> Result<NonwearSeries, EngineError> {
    if counts.is_empty() {
        return Err(EngineError::EmptyInput("count nonwear detection"));
    }

    let mut flags = vec![false; counts.len()];
    let mut i = 0;
    while i < counts.len() {
        if counts[i] > 0.0 {
            i += 1;
            continue;
        }
        // Extend a candidate run from this zero epoch.
        let start = i;
        let mut spikes = 0;
        let mut j = i;
        while j < counts.len() {
            if counts[j] <= 0.0 {
                j += 1;
            } else if counts[j] < params.spike_max_count && spikes < params.spike_tolerance {
                spikes += 1;
                j += 1;
            } else {
                break;
            }
        }
        if j - start >= params.min_run_epochs {
            for f in &mut flags[start..j] {
                *f = true;
            }
        }
        i = j.max(i + 1);
    }

    let ranges = NonwearSeries::ranges_from_flags(&flags);
    Ok(NonwearSeries {
        flags,
        ranges,
        algorithm: "count-threshold".to_string(),
        params: json!({
            "min_run_epochs": params.min_run_epochs,
            "spike_tolerance": params.spike_tolerance,
            "spike_max_count": params.spike_max_count,
            "unit": "epoch",
        }),
    })
}

/// Sensor-based detection from the capacitive-touch channel: one flag per
/// epoch window, nonwear when the majority of samples report no skin
/// contact.
pub fn detect_capacitive_nonwear(
    raw: &RawSampleSet,
    epoch_seconds: f64,
) -> Result<NonwearSeries, EngineError> {
    let Some(wear) = raw.wear.as_ref() else {
        return Err(EngineError::EmptyInput("capacitive-touch channel"));
    };
    let samples_per_epoch = (raw.sample_rate * epoch_seconds).round() as usize;
    if samples_per_epoch == 0 || wear.len() < samples_per_epoch {
        return Err(EngineError::NotEnoughSamples {
            got: wear.len(),
            need: samples_per_epoch.max(1),
        });
    }

    let n_epochs = wear.len() / samples_per_epoch;
    let mut flags = Vec::with_capacity(n_epochs);
    for e in 0..n_epochs {
        let window = &wear[e * samples_per_epoch..(e + 1) * samples_per_epoch];
        let off = window.iter().filter(|&&w| !w).count();
        flags.push(off * 2 > window.len());
    }

    let ranges = NonwearSeries::ranges_from_flags(&flags);
    Ok(NonwearSeries {
        flags,
        ranges,
        algorithm: "capacitive".to_string(),
        params: json!({"epoch_seconds": epoch_seconds, "unit": "epoch"}),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>, rate: f64) -> RawSampleSet {
        let n = x.len();
        RawSampleSet {
            x,
            y,
            z,
            timestamps: (0..n).map(|i| (i as f64 * 1000.0 / rate).round() as i64).collect(),
            sample_rate: rate,
            metadata: None,
            light: None,
            battery: None,
            wear: None,
        }
    }

    #[test]
    fn still_tail_is_flagged_moving_head_is_not() {
        // 1 Hz for 4 hours: first half wobbles, second half is dead still.
        let n = 4 * 3600;
        let wobble = |i: usize| ((i * 37) % 100) as f64 / 1000.0;
        let x: Vec<f64> = (0..n).map(|i| if i < n / 2 { wobble(i) } else { 0.0 }).collect();
        let y = x.clone();
        let z: Vec<f64> = (0..n).map(|i| if i < n / 2 { 1.0 - wobble(i) } else { 1.0 }).collect();
        let raw = raw(x, y, z, 1.0);

        let series = detect_signal_nonwear(&raw, &SignalNonwearParams::preset("default").unwrap())
            .unwrap();
        // 16 blocks of 15 minutes; the still half must be flagged.
        assert_eq!(series.flags.len(), 16);
        assert!(!series.flags[0]);
        assert!(!series.flags[5]);
        assert!(series.flags[10]);
        assert!(series.flags[15]);
        assert!(!series.ranges.is_empty());
    }

    #[test]
    fn unknown_preset_is_rejected() {
        assert!(SignalNonwearParams::preset("imaginary").is_err());
    }

    #[test]
    fn count_runs_with_spike_allowance() {
        let mut counts = vec![500.0; 300];
        for c in counts.iter_mut().take(200).skip(100) {
            *c = 0.0;
        }
        counts[150] = 50.0; // small spike inside the run
        let series = detect_count_nonwear(&counts, &CountNonwearParams::default()).unwrap();
        assert!(series.flags[100]);
        assert!(series.flags[150]);
        assert!(series.flags[199]);
        assert!(!series.flags[99]);
        assert!(!series.flags[200]);
        assert_eq!(series.ranges, vec![(100, 199)]);
    }

    #[test]
    fn short_zero_runs_are_kept_as_wear() {
        let mut counts = vec![500.0; 100];
        for c in counts.iter_mut().take(60).skip(40) {
            *c = 0.0;
        }
        let series = detect_count_nonwear(&counts, &CountNonwearParams::default()).unwrap();
        assert!(series.flags.iter().all(|&f| !f));
    }

    #[test]
    fn capacitive_channel_majority_vote() {
        let mut r = raw(vec![0.0; 600], vec![0.0; 600], vec![1.0; 600], 1.0);
        let mut wear = vec![true; 600];
        for w in wear.iter_mut().take(400).skip(120) {
            *w = false;
        }
        r.wear = Some(wear);

        let series = detect_capacitive_nonwear(&r, 60.0).unwrap();
        assert_eq!(series.flags.len(), 10);
        assert!(!series.flags[0]);
        assert!(series.flags[3]);
        assert!(series.flags[5]);
        assert!(!series.flags[8]);
    }

    #[test]
    fn capacitive_without_channel_is_an_error() {
        let r = raw(vec![0.0; 60], vec![0.0; 60], vec![1.0; 60], 1.0);
        assert!(matches!(
            detect_capacitive_nonwear(&r, 60.0),
            Err(EngineError::EmptyInput(_))
        ));
    }
}
