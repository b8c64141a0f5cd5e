use crate::{CircadianMetrics, EngineError};
use std::collections::BTreeMap;

const MS_PER_HOUR: i64 = 3_600_000;

/// Most/least-active fixed-length window statistics plus relative
/// amplitude over an epoch-level metric series.
pub fn active_window_metrics(
    values: &[f64],
    epoch_seconds: f64,
    window_hours: f64,
) -> Result<CircadianMetrics, EngineError> {
    if values.is_empty() {
        return Err(EngineError::EmptyInput("active-window metrics"));
    }
    let window = (window_hours * 3600.0 / epoch_seconds).round() as usize;
    if window == 0 || values.len() < window {
        return Err(EngineError::NotEnoughSamples {
            got: values.len(),
            need: window.max(1),
        });
    }

    // Rolling sums keep this linear in the series length.
    let mut sum: f64 = values[..window].iter().sum();
    let mut best_high = (0usize, sum);
    let mut best_low = (0usize, sum);
    for start in 1..=(values.len() - window) {
        sum += values[start + window - 1] - values[start - 1];
        if sum > best_high.1 {
            best_high = (start, sum);
        }
        if sum < best_low.1 {
            best_low = (start, sum);
        }
    }

    let most_active_mean = best_high.1 / window as f64;
    let least_active_mean = best_low.1 / window as f64;
    let denom = most_active_mean + least_active_mean;
    let relative_amplitude = if denom > 0.0 {
        (most_active_mean - least_active_mean) / denom
    } else {
        0.0
    };

    let mut out = BTreeMap::new();
    out.insert("most_active_start_epoch".to_string(), best_high.0 as f64);
    out.insert("most_active_mean".to_string(), most_active_mean);
    out.insert("least_active_start_epoch".to_string(), best_low.0 as f64);
    out.insert("least_active_mean".to_string(), least_active_mean);
    out.insert("relative_amplitude".to_string(), relative_amplitude);
    out.insert("window_hours".to_string(), window_hours);
    Ok(CircadianMetrics { values: out })
}

/// Interdaily stability and intradaily variability over hourly means.
///
/// IS compares the 24-hour profile's variance with the total variance;
/// IV compares successive-hour differences with the total variance. A
/// perfectly flat recording is defined as IS = 1, IV = 0.
pub fn variability_indices(
    values: &[f64],
    timestamps: &[i64],
) -> Result<CircadianMetrics, EngineError> {
    if values.is_empty() {
        return Err(EngineError::EmptyInput("variability indices"));
    }
    if values.len() != timestamps.len() {
        return Err(EngineError::LengthMismatch {
            left: values.len(),
            right: timestamps.len(),
        });
    }

    // Collapse the epoch series to one mean per absolute hour.
    let mut hourly: Vec<(i64, f64, usize)> = Vec::new();
    for (&v, &ts) in values.iter().zip(timestamps.iter()) {
        let hour = ts.div_euclid(MS_PER_HOUR);
        match hourly.last_mut() {
            Some((h, sum, n)) if *h == hour => {
                *sum += v;
                *n += 1;
            }
            _ => hourly.push((hour, v, 1)),
        }
    }
    if hourly.len() < 2 {
        return Err(EngineError::NotEnoughSamples {
            got: hourly.len(),
            need: 2,
        });
    }
    let hours: Vec<(i64, f64)> = hourly
        .into_iter()
        .map(|(h, sum, n)| (h, sum / n as f64))
        .collect();

    let n = hours.len() as f64;
    let grand_mean = hours.iter().map(|(_, v)| v).sum::<f64>() / n;
    let total_var: f64 = hours.iter().map(|(_, v)| (v - grand_mean).powi(2)).sum();

    // Hour-of-day profile means.
    let mut profile_sum = [0.0f64; 24];
    let mut profile_n = [0usize; 24];
    for &(h, v) in &hours {
        let hod = h.rem_euclid(24) as usize;
        profile_sum[hod] += v;
        profile_n[hod] += 1;
    }
    let occupied = profile_n.iter().filter(|&&c| c > 0).count() as f64;
    let profile_var: f64 = (0..24)
        .filter(|&h| profile_n[h] > 0)
        .map(|h| (profile_sum[h] / profile_n[h] as f64 - grand_mean).powi(2))
        .sum();

    let successive: f64 = hours
        .windows(2)
        .map(|w| (w[1].1 - w[0].1).powi(2))
        .sum();

    let (is, iv) = if total_var > 0.0 {
        (
            (n * profile_var) / (occupied * total_var),
            (n * successive) / ((n - 1.0) * total_var),
        )
    } else {
        (1.0, 0.0)
    };

    let mut out = BTreeMap::new();
    out.insert("interdaily_stability".to_string(), is);
    out.insert("intradaily_variability".to_string(), iv);
    out.insert("hours_observed".to_string(), n);
    Ok(CircadianMetrics { values: out })
}

/// Cohen's kappa for two binary raters over the same epochs.
///
/// kappa = (po - pe) / (1 - pe), with kappa = 1 when expected and
/// observed agreement are both total.
pub fn cohens_kappa(a: &[u8], b: &[u8]) -> Result<f64, EngineError> {
    if a.len() != b.len() {
        return Err(EngineError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Err(EngineError::EmptyInput("cohen's kappa"));
    }

    let n = a.len() as f64;
    let mut table = [[0.0f64; 2]; 2];
    for (&ra, &rb) in a.iter().zip(b.iter()) {
        table[(ra != 0) as usize][(rb != 0) as usize] += 1.0;
    }

    let po = (table[0][0] + table[1][1]) / n;
    let a1 = (table[1][0] + table[1][1]) / n;
    let b1 = (table[0][1] + table[1][1]) / n;
    let pe = a1 * b1 + (1.0 - a1) * (1.0 - b1);

    if (1.0 - pe).abs() < 1e-12 {
        // Both raters constant and identical: total agreement.
        return Ok(1.0);
    }
    Ok((po - pe) / (1.0 - pe))
}
