use crate::{EngineError, MetricSeries, RawSampleSet};
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use serde_json::json;

/// Filtered variants need enough signal for the zero-phase filter's edge
/// padding to be meaningful.
const MIN_FILTER_SAMPLES: usize = 50;

/// Euclidean Norm Minus One, clamped at zero: `max(0, |v| - 1)`.
pub fn enmo(x: &[f64], y: &[f64], z: &[f64]) -> Vec<f64> {
    (0..x.len())
        .map(|i| ((x[i] * x[i] + y[i] * y[i] + z[i] * z[i]).sqrt() - 1.0).max(0.0))
        .collect()
}

/// Inclination of the z axis against the horizontal plane, in degrees.
pub fn angle_z(x: &[f64], y: &[f64], z: &[f64]) -> Vec<f64> {
    (0..x.len())
        .map(|i| z[i].atan2((x[i] * x[i] + y[i] * y[i]).sqrt()).to_degrees())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BandForm {
    LowPass,
    HighPass,
    BandPass,
}

/// A named filtered-signal variant: Butterworth coefficients applied
/// zero-phase to each axis, then collapsed to a magnitude series.
#[derive(Debug, Clone)]
struct FilterSpec {
    name: &'static str,
    form: BandForm,
    /// Corner frequencies in Hz; one for low/high-pass, two for band-pass.
    cutoffs: [f64; 2],
    order: usize,
    /// Subtract 1g and clamp at zero after the norm (ENMO-style) instead
    /// of reporting the raw filtered magnitude.
    minus_one: bool,
}

const FILTER_SPECS: &[FilterSpec] = &[
    FilterSpec {
        name: "hfen",
        form: BandForm::HighPass,
        cutoffs: [0.2, 0.0],
        order: 4,
        minus_one: false,
    },
    FilterSpec {
        name: "lfen",
        form: BandForm::LowPass,
        cutoffs: [5.0, 0.0],
        order: 4,
        minus_one: false,
    },
    FilterSpec {
        name: "bfen",
        form: BandForm::BandPass,
        cutoffs: [0.2, 15.0],
        order: 4,
        minus_one: true,
    },
];

fn butter_sos(spec: &FilterSpec, sample_rate: f64) -> Vec<sci_rs::signal::filter::design::Sos<f64>> {
    // Corners are capped below Nyquist so low-rate recordings still get a
    // valid design.
    let cap = 0.45 * sample_rate;
    let (band, wn) = match spec.form {
        BandForm::LowPass => (FilterBandType::Lowpass, vec![spec.cutoffs[0].min(cap)]),
        BandForm::HighPass => (FilterBandType::Highpass, vec![spec.cutoffs[0].min(cap)]),
        BandForm::BandPass => (
            FilterBandType::Bandpass,
            vec![spec.cutoffs[0].min(cap), spec.cutoffs[1].min(cap)],
        ),
    };
    let filter = butter_dyn(
        spec.order,
        wn,
        Some(band),
        Some(false),
        Some(FilterOutputType::Sos),
        Some(sample_rate),
    );
    let DigitalFilter::Sos(SosFormatFilter { sos }) = filter else {
        unreachable!("butter_dyn returns the requested SOS form");
    };
    sos
}

fn filtered_magnitude(raw: &RawSampleSet, spec: &FilterSpec) -> Result<Vec<f64>, EngineError> {
    if raw.len() < MIN_FILTER_SAMPLES {
        return Err(EngineError::NotEnoughSamples {
            got: raw.len(),
            need: MIN_FILTER_SAMPLES,
        });
    }
    let sos = butter_sos(spec, raw.sample_rate);
    let fx = sosfiltfilt_dyn(raw.x.iter(), &sos);
    let fy = sosfiltfilt_dyn(raw.y.iter(), &sos);
    let fz = sosfiltfilt_dyn(raw.z.iter(), &sos);

    let values = (0..fx.len())
        .map(|i| {
            let norm = (fx[i] * fx[i] + fy[i] * fy[i] + fz[i] * fz[i]).sqrt();
            if spec.minus_one {
                (norm - 1.0).max(0.0)
            } else {
                norm
            }
        })
        .collect();
    Ok(values)
}

/// Names accepted by [`compute_metric`].
pub fn metric_names() -> Vec<&'static str> {
    let mut names = vec!["enmo", "anglez"];
    names.extend(FILTER_SPECS.iter().map(|s| s.name));
    names
}

/// Compute a named metric over a sample set. Metrics are per-sample; no
/// epoch structure is required.
pub fn compute_metric(name: &str, raw: &RawSampleSet) -> Result<MetricSeries, EngineError> {
    if raw.is_empty() {
        return Err(EngineError::EmptyInput("metric computation"));
    }
    let (values, params) = match name {
        "enmo" => (enmo(&raw.x, &raw.y, &raw.z), json!({})),
        "anglez" => (angle_z(&raw.x, &raw.y, &raw.z), json!({"unit": "degrees"})),
        other => {
            let Some(spec) = FILTER_SPECS.iter().find(|s| s.name == other) else {
                return Err(EngineError::UnknownAlgorithm(other.to_string()));
            };
            let values = filtered_magnitude(raw, spec)?;
            let params = json!({
                "order": spec.order,
                "cutoffs_hz": match spec.form {
                    BandForm::BandPass => vec![spec.cutoffs[0], spec.cutoffs[1]],
                    _ => vec![spec.cutoffs[0]],
                },
                "zero_phase": true,
            });
            (values, params)
        }
    };

    Ok(MetricSeries {
        name: name.to_string(),
        values,
        timestamps: Some(raw.timestamps.clone()),
        params,
    })
}
