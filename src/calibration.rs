use crate::RawSampleSet;
use log::debug;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::Serialize;

/// Tuning knobs for the sphere-fit autocalibration.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationParams {
    /// Feature window length in seconds.
    pub window_seconds: f64,
    /// Per-axis standard deviation below which a window counts as at rest.
    pub sd_threshold_g: f64,
    /// Minimum number of stationary windows required for a solve.
    pub min_points: usize,
    /// A sphere side counts as covered when a window mean crosses this.
    pub sphere_threshold_g: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            window_seconds: 10.0,
            sd_threshold_g: 0.013,
            min_points: 10,
            sphere_threshold_g: 0.3,
        }
    }
}

/// Result of an autocalibration attempt. On failure the transform is the
/// identity so callers can apply it unconditionally.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationOutcome {
    pub success: bool,
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub error_before: f64,
    pub error_after: f64,
    pub points_used: usize,
    pub status: String,
}

impl CalibrationOutcome {
    fn failure(status: impl Into<String>, points_used: usize, error: f64) -> Self {
        Self {
            success: false,
            scale: [1.0; 3],
            offset: [0.0; 3],
            error_before: error,
            error_after: error,
            points_used,
            status: status.into(),
        }
    }
}

/// Per-window features used for stationary-point selection: mean vector
/// magnitude, per-axis mean, per-axis sample standard deviation.
#[derive(Debug, Clone, Copy)]
struct WindowFeatures {
    mean_norm: f64,
    mean: [f64; 3],
    sd: [f64; 3],
}

fn window_features(x: &[f64], y: &[f64], z: &[f64]) -> Option<WindowFeatures> {
    let n = x.len() as f64;
    let mut sums = [0.0f64; 3];
    let mut norm_sum = 0.0;
    for i in 0..x.len() {
        if !(x[i].is_finite() && y[i].is_finite() && z[i].is_finite()) {
            // Sentinel / clipped window, unusable for fitting.
            return None;
        }
        sums[0] += x[i];
        sums[1] += y[i];
        sums[2] += z[i];
        norm_sum += (x[i] * x[i] + y[i] * y[i] + z[i] * z[i]).sqrt();
    }
    let mean = [sums[0] / n, sums[1] / n, sums[2] / n];

    let mut sq = [0.0f64; 3];
    for i in 0..x.len() {
        sq[0] += (x[i] - mean[0]).powi(2);
        sq[1] += (y[i] - mean[1]).powi(2);
        sq[2] += (z[i] - mean[2]).powi(2);
    }
    let denom = (n - 1.0).max(1.0);
    let sd = [
        (sq[0] / denom).sqrt(),
        (sq[1] / denom).sqrt(),
        (sq[2] / denom).sqrt(),
    ];

    Some(WindowFeatures {
        mean_norm: norm_sum / n,
        mean,
        sd,
    })
}

/// Select the stationary window means used as fit points.
fn stationary_points(raw: &RawSampleSet, params: &CalibrationParams) -> Vec<WindowFeatures> {
    let samples_per_window = (raw.sample_rate * params.window_seconds).round() as usize;
    if samples_per_window == 0 || raw.len() < samples_per_window {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let n_windows = raw.len() / samples_per_window;
    for w in 0..n_windows {
        let lo = w * samples_per_window;
        let hi = lo + samples_per_window;
        windows.push(window_features(
            &raw.x[lo..hi],
            &raw.y[lo..hi],
            &raw.z[lo..hi],
        ));
    }

    let mut kept: Vec<WindowFeatures> = Vec::new();
    let mut prev_bits: Option<[u64; 3]> = None;
    // The first window is dropped outright; devices settle during it.
    for feat in windows.into_iter().skip(1) {
        let Some(feat) = feat else {
            prev_bits = None;
            continue;
        };
        // Idle devices emit the exact same window over and over; repeats
        // carry no new information for the fit.
        let bits = [
            feat.mean[0].to_bits(),
            feat.mean[1].to_bits(),
            feat.mean[2].to_bits(),
        ];
        if prev_bits == Some(bits) {
            continue;
        }
        prev_bits = Some(bits);

        // Magnitudes far from any plausible rest reading mark sentinel
        // windows (clipped or fill values).
        if !(0.1..4.0).contains(&feat.mean_norm) {
            continue;
        }

        let is_stationary = feat.sd.iter().all(|&s| s < params.sd_threshold_g)
            && feat.mean.iter().all(|&m| m.abs() <= 2.0);
        if is_stationary {
            kept.push(feat);
        }
    }
    kept
}

/// Mean absolute deviation of the calibrated magnitude from 1g.
fn magnitude_error(points: &[WindowFeatures], offset: &[f64; 3], scale: &[f64; 3]) -> f64 {
    let sum: f64 = points
        .iter()
        .map(|p| {
            let nx = (p.mean[0] + offset[0]) * scale[0];
            let ny = (p.mean[1] + offset[1]) * scale[1];
            let nz = (p.mean[2] + offset[2]) * scale[2];
            ((nx * nx + ny * ny + nz * nz).sqrt() - 1.0).abs()
        })
        .sum();
    sum / points.len() as f64
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

/// Solve a small dense system by Gaussian elimination with partial
/// pivoting. Returns None when the system is singular.
fn solve_dense(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut aug = Array2::<f64>::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n]] = b[i];
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&p, &q| {
            aug[[p, col]].abs().partial_cmp(&aug[[q, col]].abs()).unwrap()
        })?;
        if aug[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..=n {
                let tmp = aug[[col, j]];
                aug[[col, j]] = aug[[pivot, j]];
                aug[[pivot, j]] = tmp;
            }
        }
        for row in (col + 1)..n {
            let factor = aug[[row, col]] / aug[[col, col]];
            for j in col..=n {
                aug[[row, j]] -= factor * aug[[col, j]];
            }
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for row in (0..n).rev() {
        let mut acc = aug[[row, n]];
        for j in (row + 1)..n {
            acc -= aug[[row, j]] * x[j];
        }
        x[row] = acc / aug[[row, row]];
    }
    Some(x)
}

/// Levenberg-Marquardt over 6 unknowns (3 offsets, 3 scales) minimizing
/// the squared deviation of calibrated magnitudes from 1g.
fn solve_sphere_fit(points: &[WindowFeatures]) -> Option<([f64; 3], [f64; 3])> {
    let n = points.len();
    let mut offset = [0.0f64; 3];
    let mut scale = [1.0f64; 3];
    let mut lambda = 1e-3;

    let cost = |o: &[f64; 3], s: &[f64; 3]| -> f64 {
        points
            .iter()
            .map(|p| {
                let nx = (p.mean[0] + o[0]) * s[0];
                let ny = (p.mean[1] + o[1]) * s[1];
                let nz = (p.mean[2] + o[2]) * s[2];
                let r = (nx * nx + ny * ny + nz * nz).sqrt() - 1.0;
                r * r
            })
            .sum()
    };

    let mut current_cost = cost(&offset, &scale);

    for iteration in 0..100 {
        // Residuals and analytic Jacobian at the current parameters.
        let mut jac = Array2::<f64>::zeros((n, 6));
        let mut res = Array1::<f64>::zeros(n);
        for (i, p) in points.iter().enumerate() {
            let c = [
                (p.mean[0] + offset[0]) * scale[0],
                (p.mean[1] + offset[1]) * scale[1],
                (p.mean[2] + offset[2]) * scale[2],
            ];
            let norm = (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt().max(1e-12);
            res[i] = norm - 1.0;
            for j in 0..3 {
                jac[[i, j]] = scale[j] * c[j] / norm;
                jac[[i, j + 3]] = (p.mean[j] + offset[j]) * c[j] / norm;
            }
        }

        let jt = jac.t();
        let jtj = jt.dot(&jac);
        let grad = jt.dot(&res);

        let mut stepped = false;
        for _ in 0..10 {
            let mut damped = jtj.clone();
            for d in 0..6 {
                damped[[d, d]] += lambda * jtj[[d, d]].max(1e-9);
            }
            let Some(delta) = solve_dense(&damped, &grad) else {
                lambda *= 10.0;
                continue;
            };

            let candidate_offset = [
                offset[0] - delta[0],
                offset[1] - delta[1],
                offset[2] - delta[2],
            ];
            let candidate_scale = [
                scale[0] - delta[3],
                scale[1] - delta[4],
                scale[2] - delta[5],
            ];
            if candidate_scale.iter().any(|&s| s <= 0.0) {
                lambda *= 10.0;
                continue;
            }

            let candidate_cost = cost(&candidate_offset, &candidate_scale);
            if candidate_cost < current_cost {
                let improvement = current_cost - candidate_cost;
                offset = candidate_offset;
                scale = candidate_scale;
                current_cost = candidate_cost;
                lambda = (lambda / 10.0).max(1e-12);
                stepped = true;
                if improvement < 1e-14 {
                    return Some((offset, scale));
                }
                break;
            }
            lambda *= 10.0;
        }

        if !stepped {
            debug!("sphere fit stalled after {} iterations", iteration);
            break;
        }
    }

    Some((offset, scale))
}

/// Autocalibrate against the 1g sphere. Data-dependent rejection (too few
/// stationary points, poor sphere coverage) is a `success = false` outcome
/// with a diagnostic status, never an error.
pub fn calibrate(raw: &RawSampleSet, params: &CalibrationParams) -> CalibrationOutcome {
    let points = stationary_points(raw, params);

    if points.len() < params.min_points {
        return CalibrationOutcome::failure(
            format!(
                "not enough stationary points ({} < {})",
                points.len(),
                params.min_points
            ),
            points.len(),
            if points.is_empty() {
                0.0
            } else {
                round5(magnitude_error(&points, &[0.0; 3], &[1.0; 3]))
            },
        );
    }

    // Sphere coverage: each axis must reach past the threshold on at
    // least one side, and at least 3 of the 6 sides must be covered.
    let t = params.sphere_threshold_g;
    let mut sides = 0usize;
    let mut axes_touched = 0usize;
    for axis in 0..3 {
        let min = points.iter().map(|p| p.mean[axis]).fold(f64::INFINITY, f64::min);
        let max = points
            .iter()
            .map(|p| p.mean[axis])
            .fold(f64::NEG_INFINITY, f64::max);
        let neg = min < -t;
        let pos = max > t;
        sides += neg as usize + pos as usize;
        axes_touched += (neg || pos) as usize;
    }
    let error_before = round5(magnitude_error(&points, &[0.0; 3], &[1.0; 3]));
    if sides < 3 || axes_touched < 3 {
        return CalibrationOutcome::failure(
            "not enough points on all sides of sphere",
            points.len(),
            error_before,
        );
    }

    let Some((offset, scale)) = solve_sphere_fit(&points) else {
        return CalibrationOutcome::failure(
            "sphere fit did not converge",
            points.len(),
            error_before,
        );
    };

    let error_after = round5(magnitude_error(&points, &offset, &scale));
    debug!(
        "calibration fit: {} points, error {} -> {}",
        points.len(),
        error_before,
        error_after
    );

    CalibrationOutcome {
        success: true,
        scale,
        offset,
        error_before,
        error_after,
        points_used: points.len(),
        status: format!("calibrated on {} stationary points", points.len()),
    }
}

/// Apply a calibration to plain per-axis arrays: `(raw + offset) * scale`.
pub fn apply_calibration(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    scale: &[f64; 3],
    offset: &[f64; 3],
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let map = |vals: &[f64], axis: usize| -> Vec<f64> {
        vals.iter().map(|v| (v + offset[axis]) * scale[axis]).collect()
    };
    (map(x, 0), map(y, 1), map(z, 2))
}

/// Apply a calibration to a whole sample set, leaving everything but the
/// axis arrays untouched.
pub fn apply_to_samples(raw: &RawSampleSet, outcome: &CalibrationOutcome) -> RawSampleSet {
    let (x, y, z) = apply_calibration(&raw.x, &raw.y, &raw.z, &outcome.scale, &outcome.offset);
    RawSampleSet {
        x,
        y,
        z,
        ..raw.clone()
    }
}

/// Which calibration axis a column feeds, judged by its name.
fn axis_for_column(name: &str) -> Option<usize> {
    let lower = name.to_ascii_lowercase();
    for (axis, tag) in ["x", "y", "z"].iter().enumerate() {
        if lower == *tag || lower.ends_with(&format!("_{}", tag)) {
            return Some(axis);
        }
    }
    None
}

/// Apply a calibration to a tabular structure, locating the axis columns
/// by name (`x`/`y`/`z` or any `*_x`-style suffix, case-insensitive).
pub fn apply_calibration_frame(
    df: &DataFrame,
    outcome: &CalibrationOutcome,
) -> PolarsResult<DataFrame> {
    let mut out = df.clone();
    let targets: Vec<(String, usize)> = df
        .get_column_names()
        .iter()
        .filter_map(|name| axis_for_column(name.as_str()).map(|axis| (name.to_string(), axis)))
        .collect();

    for (name, axis) in targets {
        let scale = outcome.scale[axis];
        let offset = outcome.offset[axis];
        let column = out.column(&name)?.as_materialized_series().clone();
        let calibrated: Float64Chunked = column
            .f64()?
            .apply_values(|v| (v + offset) * scale);
        out.with_column(calibrated.into_series().with_name(name.as_str().into()))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_from_windows(window_means: &[[f64; 3]], rate: f64, window_seconds: f64) -> RawSampleSet {
        let per_window = (rate * window_seconds).round() as usize;
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut z = Vec::new();
        for mean in window_means {
            for i in 0..per_window {
                // A tiny alternating wobble keeps consecutive windows from
                // being bit-identical without breaking stationarity.
                let jitter = if i % 2 == 0 { 1e-5 } else { -1e-5 };
                x.push(mean[0] + jitter);
                y.push(mean[1] + jitter);
                z.push(mean[2] + jitter);
            }
        }
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

    /// Unit directions covering all six sphere sides plus diagonals.
    fn sphere_directions() -> Vec<[f64; 3]> {
        let d = 1.0 / 3f64.sqrt();
        vec![
            [1.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, -1.0],
            [d, d, d],
            [-d, d, d],
            [d, -d, d],
            [d, d, -d],
            [-d, -d, d],
            [-d, d, -d],
            [d, -d, -d],
            [-d, -d, -d],
        ]
    }

    #[test]
    fn identity_round_trip() {
        let x = vec![0.1, -0.2, 0.3];
        let y = vec![0.4, 0.5, -0.6];
        let z = vec![0.7, -0.8, 0.9];
        let (cx, cy, cz) = apply_calibration(&x, &y, &z, &[1.0; 3], &[0.0; 3]);
        assert_eq!(cx, x);
        assert_eq!(cy, y);
        assert_eq!(cz, z);
    }

    #[test]
    fn too_few_stationary_points_fails_with_identity() {
        // Four stationary windows (first is dropped), well under the
        // default minimum of ten.
        let means = [[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]];
        let raw = raw_from_windows(&means, 10.0, 10.0);
        let outcome = calibrate(&raw, &CalibrationParams::default());
        assert!(!outcome.success);
        assert_eq!(outcome.scale, [1.0; 3]);
        assert_eq!(outcome.offset, [0.0; 3]);
        assert!(outcome.status.contains("not enough stationary points"));
    }

    #[test]
    fn one_sided_data_fails_sphere_check() {
        // Plenty of points, all of them near +z.
        let means: Vec<[f64; 3]> = (0..15)
            .map(|i| [0.001 * i as f64, 0.0, 1.0])
            .collect();
        let raw = raw_from_windows(&means, 10.0, 10.0);
        let outcome = calibrate(&raw, &CalibrationParams::default());
        assert!(!outcome.success);
        assert!(outcome.status.contains("sides of sphere"));
        assert_eq!(outcome.scale, [1.0; 3]);
    }

    #[test]
    fn recovers_known_scale_and_offset() {
        let true_offset = [0.05, -0.03, 0.02];
        let true_scale = [1.02, 0.97, 1.01];
        // measured = unit/scale - offset, so (measured + offset) * scale
        // lands exactly on the sphere.
        let means: Vec<[f64; 3]> = sphere_directions()
            .into_iter()
            .map(|u| {
                [
                    u[0] / true_scale[0] - true_offset[0],
                    u[1] / true_scale[1] - true_offset[1],
                    u[2] / true_scale[2] - true_offset[2],
                ]
            })
            .collect();
        let raw = raw_from_windows(&means, 10.0, 10.0);
        let outcome = calibrate(&raw, &CalibrationParams::default());
        assert!(outcome.success, "status: {}", outcome.status);
        for axis in 0..3 {
            assert!(
                (outcome.offset[axis] - true_offset[axis]).abs() < 1e-3,
                "offset[{}] = {}",
                axis,
                outcome.offset[axis]
            );
            assert!(
                (outcome.scale[axis] - true_scale[axis]).abs() < 1e-3,
                "scale[{}] = {}",
                axis,
                outcome.scale[axis]
            );
        }
        assert!(outcome.error_after <= outcome.error_before);
    }

    #[test]
    fn recalibrating_calibrated_data_is_stable() {
        let true_offset = [0.04, -0.02, 0.01];
        let true_scale = [1.03, 0.98, 1.02];
        let means: Vec<[f64; 3]> = sphere_directions()
            .into_iter()
            .map(|u| {
                [
                    u[0] / true_scale[0] - true_offset[0],
                    u[1] / true_scale[1] - true_offset[1],
                    u[2] / true_scale[2] - true_offset[2],
                ]
            })
            .collect();
        let raw = raw_from_windows(&means, 10.0, 10.0);
        let first = calibrate(&raw, &CalibrationParams::default());
        assert!(first.success);

        let corrected = apply_to_samples(&raw, &first);
        let second = calibrate(&corrected, &CalibrationParams::default());
        assert!(second.success);
        // Already-calibrated data should not need further correction.
        assert!(second.error_before <= first.error_after + 1e-5);
    }

    #[test]
    fn frame_calibration_finds_axis_columns() {
        let df = df!(
            "accel_x" => [0.0f64, 1.0],
            "accel_y" => [0.0f64, 2.0],
            "accel_z" => [1.0f64, 0.0],
            "lux" => [5.0f64, 6.0],
        )
        .unwrap();
        let outcome = CalibrationOutcome {
            success: true,
            scale: [2.0, 1.0, 1.0],
            offset: [0.5, 0.0, 0.0],
            error_before: 0.0,
            error_after: 0.0,
            points_used: 0,
            status: String::new(),
        };
        let out = apply_calibration_frame(&df, &outcome).unwrap();
        let x: Vec<f64> = out
            .column("accel_x")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(x, vec![1.0, 3.0]);
        let lux: Vec<f64> = out
            .column("lux")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(lux, vec![5.0, 6.0]);
    }
}
