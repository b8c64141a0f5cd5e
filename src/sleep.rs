use crate::metrics::angle_z;
use crate::{EngineError, RawSampleSet, SleepScoreSeries, SleepWindow};
use chrono::DateTime;
use log::debug;
use serde_json::json;

const SLEEP: u8 = 1;
const WAKE: u8 = 0;

/// Sadeh (1994) preprocessing variants. `Capped` clamps activity counts
/// at 300 first, the rescaling most reference tools apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SadehVariant {
    Original,
    Capped,
}

impl SadehVariant {
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        match name {
            "original" => Ok(Self::Original),
            "capped" => Ok(Self::Capped),
            other => Err(EngineError::UnknownAlgorithm(format!("sadeh:{}", other))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Capped => "capped",
        }
    }
}

/// Cole-Kripke (1992) one-minute-epoch parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColeKripkeVariant {
    /// Mean activity per minute: scale 0.001.
    MeanActivity,
    /// Maximum activity per minute: scale 0.00001.
    MaxActivity,
}

impl ColeKripkeVariant {
    pub fn from_name(name: &str) -> Result<Self, EngineError> {
        match name {
            "mean-activity" => Ok(Self::MeanActivity),
            "max-activity" => Ok(Self::MaxActivity),
            other => Err(EngineError::UnknownAlgorithm(format!("cole-kripke:{}", other))),
        }
    }

    fn coefficients(self) -> (f64, [f64; 7]) {
        match self {
            Self::MeanActivity => (0.001, [106.0, 54.0, 58.0, 76.0, 230.0, 74.0, 67.0]),
            Self::MaxActivity => (
                0.00001,
                [404.0, 598.0, 326.0, 441.0, 1408.0, 508.0, 350.0],
            ),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::MeanActivity => "mean-activity",
            Self::MaxActivity => "max-activity",
        }
    }
}

fn count_at(counts: &[f64], idx: isize) -> f64 {
    // Epochs before the recording started / after it ended count as no
    // activity.
    if idx < 0 || idx as usize >= counts.len() {
        0.0
    } else {
        counts[idx as usize]
    }
}

/// Sadeh sleep/wake scoring on per-minute activity counts.
///
/// SI = 7.601 - 0.065*MW5 - 1.08*NAT - 0.056*SD6 - 0.703*LG, sleep when
/// SI >= 0. MW5 is the mean over the 11-epoch window centered on the
/// epoch, NAT the number of window epochs with counts in [50, 100), SD6
/// the standard deviation of the epoch and its 5 predecessors, LG the
/// natural log of the epoch count plus one.
pub fn sadeh(counts: &[f64], variant: SadehVariant) -> Result<SleepScoreSeries, EngineError> {
    if counts.is_empty() {
        return Err(EngineError::EmptyInput("sadeh scoring"));
    }
    let counts: Vec<f64> = match variant {
        SadehVariant::Original => counts.to_vec(),
        SadehVariant::Capped => counts.iter().map(|&c| c.min(300.0)).collect(),
    };

    let mut scores = Vec::with_capacity(counts.len());
    for i in 0..counts.len() as isize {
        let window: Vec<f64> = (i - 5..=i + 5).map(|j| count_at(&counts, j)).collect();
        let mean_w5 = window.iter().sum::<f64>() / window.len() as f64;
        let nat = window.iter().filter(|&&c| (50.0..100.0).contains(&c)).count() as f64;

        let recent: Vec<f64> = (i - 5..=i).map(|j| count_at(&counts, j)).collect();
        let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let sd6 = (recent.iter().map(|c| (c - recent_mean).powi(2)).sum::<f64>()
            / recent.len() as f64)
            .sqrt();

        let lg = (counts[i as usize] + 1.0).ln();
        let si = 7.601 - 0.065 * mean_w5 - 1.08 * nat - 0.056 * sd6 - 0.703 * lg;
        scores.push(if si >= 0.0 { SLEEP } else { WAKE });
    }

    Ok(SleepScoreSeries {
        scores,
        algorithm: "sadeh".to_string(),
        confidence: None,
        params: json!({"variant": variant.label(), "threshold": 0.0}),
    })
}

/// Cole-Kripke sleep/wake scoring on per-minute activity counts. D is a
/// weighted sum over the epoch, the 4 preceding and the 2 following
/// epochs; sleep when D < 1.
pub fn cole_kripke(
    counts: &[f64],
    variant: ColeKripkeVariant,
) -> Result<SleepScoreSeries, EngineError> {
    if counts.is_empty() {
        return Err(EngineError::EmptyInput("cole-kripke scoring"));
    }
    let (scale, weights) = variant.coefficients();

    let mut scores = Vec::with_capacity(counts.len());
    for i in 0..counts.len() as isize {
        let mut d = 0.0;
        for (w, offset) in weights.iter().zip(-4isize..=2) {
            d += w * count_at(counts, i + offset);
        }
        d *= scale;
        scores.push(if d < 1.0 { SLEEP } else { WAKE });
    }

    Ok(SleepScoreSeries {
        scores,
        algorithm: "cole-kripke".to_string(),
        confidence: None,
        params: json!({"variant": variant.label(), "scale": scale}),
    })
}

/// Dispatch an epoch-count scorer by name, e.g. ("sadeh", Some("capped")).
pub fn score_epoch_counts(
    algorithm: &str,
    variant: Option<&str>,
    counts: &[f64],
) -> Result<SleepScoreSeries, EngineError> {
    match algorithm {
        "sadeh" => sadeh(
            counts,
            SadehVariant::from_name(variant.unwrap_or("original"))?,
        ),
        "cole-kripke" => cole_kripke(
            counts,
            ColeKripkeVariant::from_name(variant.unwrap_or("mean-activity"))?,
        ),
        other => Err(EngineError::UnknownAlgorithm(other.to_string())),
    }
}

/// Parameters for the sustained-inactivity-bout detector.
#[derive(Debug, Clone)]
pub struct SibParams {
    pub angle_epoch_seconds: f64,
    pub angle_threshold_deg: f64,
    pub inactivity_minutes: f64,
    /// Below this many posture changes the whole series counts as one
    /// motionless bout.
    pub degenerate_change_limit: usize,
}

impl Default for SibParams {
    fn default() -> Self {
        Self {
            angle_epoch_seconds: 5.0,
            angle_threshold_deg: 5.0,
            inactivity_minutes: 5.0,
            degenerate_change_limit: 10,
        }
    }
}

/// Mean z-angle per epoch; an epoch with no finite samples is NaN.
fn epoch_angles(raw: &RawSampleSet, epoch_seconds: f64) -> Result<(Vec<f64>, usize), EngineError> {
    let samples_per_epoch = (raw.sample_rate * epoch_seconds).round() as usize;
    if samples_per_epoch == 0 || raw.len() < samples_per_epoch {
        return Err(EngineError::NotEnoughSamples {
            got: raw.len(),
            need: samples_per_epoch.max(1),
        });
    }
    let per_sample = angle_z(&raw.x, &raw.y, &raw.z);
    let n_epochs = per_sample.len() / samples_per_epoch;
    let mut angles = Vec::with_capacity(n_epochs);
    for e in 0..n_epochs {
        let window = &per_sample[e * samples_per_epoch..(e + 1) * samples_per_epoch];
        let valid: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
        if valid.is_empty() {
            angles.push(f64::NAN);
        } else {
            angles.push(valid.iter().sum::<f64>() / valid.len() as f64);
        }
    }
    Ok((angles, samples_per_epoch))
}

/// Posture-change epoch indices: where the angle moves more than the
/// threshold against the previous epoch. Undefined angles never trigger.
fn posture_changes(angles: &[f64], threshold_deg: f64) -> Vec<usize> {
    let mut changes = Vec::new();
    for i in 1..angles.len() {
        if angles[i].is_finite()
            && angles[i - 1].is_finite()
            && (angles[i] - angles[i - 1]).abs() > threshold_deg
        {
            changes.push(i);
        }
    }
    changes
}

/// Classify an epoch-level angle series into sustained-inactivity bouts.
/// Epochs strictly between two posture changes further apart than the
/// inactivity threshold are SLEEP; everything else is WAKE.
pub fn sib_from_angles(angles: &[f64], params: &SibParams) -> Result<SleepScoreSeries, EngineError> {
    if angles.is_empty() {
        return Err(EngineError::EmptyInput("sustained-inactivity detection"));
    }
    let changes = posture_changes(angles, params.angle_threshold_deg);
    let params_json = json!({
        "angle_epoch_seconds": params.angle_epoch_seconds,
        "angle_threshold_deg": params.angle_threshold_deg,
        "inactivity_minutes": params.inactivity_minutes,
    });

    if changes.len() < 2 {
        // A subject who never moved is one long bout; a short burst of
        // changes with nothing in between is unclassifiable rest.
        let fill = if changes.len() < params.degenerate_change_limit {
            SLEEP
        } else {
            WAKE
        };
        debug!(
            "sustained-inactivity: {} posture change(s), degenerate fill={}",
            changes.len(),
            fill
        );
        return Ok(SleepScoreSeries {
            scores: vec![fill; angles.len()],
            algorithm: "sustained-inactivity".to_string(),
            confidence: None,
            params: params_json,
        });
    }

    let threshold_epochs =
        (params.inactivity_minutes * 60.0 / params.angle_epoch_seconds).round() as usize;
    let mut scores = vec![WAKE; angles.len()];
    for pair in changes.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a > threshold_epochs {
            for s in &mut scores[a + 1..b] {
                *s = SLEEP;
            }
        }
    }

    Ok(SleepScoreSeries {
        scores,
        algorithm: "sustained-inactivity".to_string(),
        confidence: None,
        params: params_json,
    })
}

/// Sustained-inactivity-bout detection from raw samples.
pub fn sustained_inactivity(
    raw: &RawSampleSet,
    params: &SibParams,
) -> Result<SleepScoreSeries, EngineError> {
    let (angles, _) = epoch_angles(raw, params.angle_epoch_seconds)?;
    sib_from_angles(&angles, params)
}

/// Parameters for the heuristic sleep-window detector.
#[derive(Debug, Clone)]
pub struct SleepWindowParams {
    pub angle_epoch_seconds: f64,
    pub rolling_median_minutes: f64,
    /// Threshold is this multiple of the 10th percentile of the rolling
    /// median of angle changes.
    pub threshold_multiplier: f64,
    /// Floor keeping flat signals from producing a zero threshold.
    pub threshold_floor_deg: f64,
    pub min_block_minutes: f64,
    pub merge_gap_minutes: f64,
    pub sib: SibParams,
}

impl Default for SleepWindowParams {
    fn default() -> Self {
        Self {
            angle_epoch_seconds: 5.0,
            rolling_median_minutes: 5.0,
            threshold_multiplier: 15.0,
            threshold_floor_deg: 0.13,
            min_block_minutes: 30.0,
            merge_gap_minutes: 60.0,
            sib: SibParams::default(),
        }
    }
}

fn rolling_median(values: &[f64], window: usize) -> Vec<f64> {
    let half = window / 2;
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(values.len());
        let mut slice: Vec<f64> = values[lo..hi].iter().copied().filter(|v| v.is_finite()).collect();
        if slice.is_empty() {
            out.push(f64::NAN);
            continue;
        }
        slice.sort_by(|a, b| a.partial_cmp(b).unwrap());
        out.push(slice[slice.len() / 2]);
    }
    out
}

/// Detect the main sleep window from raw samples: long stretches of small
/// postural angle change, merged across short interruptions, longest
/// stretch wins. Returns None when the recording has no qualifying block.
pub fn detect_sleep_window(
    raw: &RawSampleSet,
    params: &SleepWindowParams,
) -> Result<Option<SleepWindow>, EngineError> {
    let (angles, samples_per_epoch) = epoch_angles(raw, params.angle_epoch_seconds)?;
    if angles.len() < 2 {
        return Err(EngineError::NotEnoughSamples {
            got: angles.len(),
            need: 2,
        });
    }

    // Absolute epoch-to-epoch angle change, smoothed with a rolling
    // median so isolated twitches do not split a candidate block.
    let diffs: Vec<f64> = angles
        .windows(2)
        .map(|w| {
            if w[0].is_finite() && w[1].is_finite() {
                (w[1] - w[0]).abs()
            } else {
                f64::NAN
            }
        })
        .collect();
    let median_window =
        ((params.rolling_median_minutes * 60.0 / params.angle_epoch_seconds) as usize).max(1);
    let smoothed = rolling_median(&diffs, median_window);

    let mut sorted: Vec<f64> = smoothed.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return Ok(None);
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p10 = sorted[(sorted.len() as f64 * 0.10) as usize];
    let threshold = (p10 * params.threshold_multiplier).max(params.threshold_floor_deg);

    // Sub-threshold runs, then merge runs separated by short gaps.
    let min_block =
        (params.min_block_minutes * 60.0 / params.angle_epoch_seconds).round() as usize;
    let merge_gap =
        (params.merge_gap_minutes * 60.0 / params.angle_epoch_seconds).round() as usize;

    let mut blocks: Vec<(usize, usize)> = Vec::new();
    let mut start = None;
    for (i, &v) in smoothed.iter().enumerate() {
        let quiet = v.is_finite() && v < threshold;
        match (quiet, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                if i - s >= min_block {
                    blocks.push((s, i - 1));
                }
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        if smoothed.len() - s >= min_block {
            blocks.push((s, smoothed.len() - 1));
        }
    }
    if blocks.is_empty() {
        debug!("sleep-window: no block of {} quiet epochs", min_block);
        return Ok(None);
    }

    let mut merged: Vec<(usize, usize)> = vec![blocks[0]];
    for &(s, e) in &blocks[1..] {
        let last = merged.last_mut().unwrap();
        if s - last.1 <= merge_gap {
            last.1 = e;
        } else {
            merged.push((s, e));
        }
    }

    let &(onset_epoch, offset_epoch) = merged
        .iter()
        .max_by_key(|(s, e)| e - s)
        .unwrap();

    // Fill in sleep statistics from the bout detector inside the window.
    let sib = sib_from_angles(&angles, &params.sib)?;
    let epochs_in_window = offset_epoch - onset_epoch + 1;
    let sleep_epochs = sib.scores[onset_epoch..=offset_epoch.min(sib.scores.len() - 1)]
        .iter()
        .filter(|&&s| s == SLEEP)
        .count();
    let window_minutes = epochs_in_window as f64 * params.angle_epoch_seconds / 60.0;
    let minutes_asleep = sleep_epochs as f64 * params.angle_epoch_seconds / 60.0;

    let onset_sample = onset_epoch * samples_per_epoch;
    let offset_sample = ((offset_epoch + 1) * samples_per_epoch - 1).min(raw.len() - 1);

    Ok(Some(SleepWindow {
        onset_index: onset_sample,
        offset_index: offset_sample,
        onset: DateTime::from_timestamp_millis(raw.timestamps[onset_sample]).unwrap(),
        offset: DateTime::from_timestamp_millis(raw.timestamps[offset_sample]).unwrap(),
        minutes_asleep,
        minutes_awake_after_onset: (window_minutes - minutes_asleep).max(0.0),
        efficiency_percent: if window_minutes > 0.0 {
            minutes_asleep / window_minutes * 100.0
        } else {
            0.0
        },
        method: "circadian-zone".to_string(),
    }))
}
