use crate::calibration::{self, CalibrationOutcome, CalibrationParams};
use crate::circadian;
use crate::device;
use crate::epochs::{self, EpochSummary};
use crate::imputation::{self, ImputationOutcome};
use crate::metrics;
use crate::nonwear::{self, CountNonwearParams, SignalNonwearParams};
use crate::sleep::{self, SibParams, SleepWindowParams};
use crate::{
    CircadianMetrics, EngineError, MetricSeries, NonwearSeries, RawSampleSet, SleepScoreSeries,
    SleepWindow,
};
use std::path::Path;
use std::sync::OnceLock;

/// One discrete pipeline operation a backend may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    ParseDevice,
    Calibrate,
    Impute,
    Epoch,
    Metrics,
    SleepEpochScoring,
    SleepRawScoring,
    SleepWindowDetection,
    Nonwear,
    Circadian,
    Agreement,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::ParseDevice,
        Capability::Calibrate,
        Capability::Impute,
        Capability::Epoch,
        Capability::Metrics,
        Capability::SleepEpochScoring,
        Capability::SleepRawScoring,
        Capability::SleepWindowDetection,
        Capability::Nonwear,
        Capability::Circadian,
        Capability::Agreement,
    ];

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// A backend's capability set, fixed when the backend is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub const fn full() -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < Capability::ALL.len() {
            bits |= Capability::ALL[i].bit();
            i += 1;
        }
        Self(bits)
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }
}

/// A signal-processing backend: one method per pipeline operation.
/// Callers query `supports` and never branch on implementation identity;
/// an operation outside the capability set returns
/// [`EngineError::Unsupported`].
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn capabilities(&self) -> Capabilities;

    fn supports(&self, cap: Capability) -> bool {
        self.capabilities().contains(cap)
    }

    fn read_device_file(
        &self,
        path: &Path,
        include_aux: bool,
    ) -> Result<RawSampleSet, EngineError>;

    fn calibrate(
        &self,
        raw: &RawSampleSet,
        params: &CalibrationParams,
    ) -> Result<CalibrationOutcome, EngineError>;

    fn impute(&self, raw: &RawSampleSet, tolerance_ms: f64)
        -> Result<ImputationOutcome, EngineError>;

    fn epochs(&self, raw: &RawSampleSet, epoch_seconds: f64) -> Result<EpochSummary, EngineError>;

    fn metric(&self, name: &str, raw: &RawSampleSet) -> Result<MetricSeries, EngineError>;

    fn score_epoch_counts(
        &self,
        algorithm: &str,
        variant: Option<&str>,
        counts: &[f64],
    ) -> Result<SleepScoreSeries, EngineError>;

    fn sustained_inactivity(
        &self,
        raw: &RawSampleSet,
        params: &SibParams,
    ) -> Result<SleepScoreSeries, EngineError>;

    fn detect_sleep_window(
        &self,
        raw: &RawSampleSet,
        params: &SleepWindowParams,
    ) -> Result<Option<SleepWindow>, EngineError>;

    fn signal_nonwear(
        &self,
        raw: &RawSampleSet,
        params: &SignalNonwearParams,
    ) -> Result<NonwearSeries, EngineError>;

    fn count_nonwear(
        &self,
        counts: &[f64],
        params: &CountNonwearParams,
    ) -> Result<NonwearSeries, EngineError>;

    fn capacitive_nonwear(
        &self,
        raw: &RawSampleSet,
        epoch_seconds: f64,
    ) -> Result<NonwearSeries, EngineError>;

    fn active_window_metrics(
        &self,
        values: &[f64],
        epoch_seconds: f64,
        window_hours: f64,
    ) -> Result<CircadianMetrics, EngineError>;

    fn variability_indices(
        &self,
        values: &[f64],
        timestamps: &[i64],
    ) -> Result<CircadianMetrics, EngineError>;

    fn cohens_kappa(&self, a: &[u8], b: &[u8]) -> Result<f64, EngineError>;
}

/// The portable implementation: pure Rust, always compiled, supports the
/// full operation set.
pub struct ReferenceBackend;

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn read_device_file(
        &self,
        path: &Path,
        include_aux: bool,
    ) -> Result<RawSampleSet, EngineError> {
        device::read_device_file(path, include_aux)
    }

    fn calibrate(
        &self,
        raw: &RawSampleSet,
        params: &CalibrationParams,
    ) -> Result<CalibrationOutcome, EngineError> {
        Ok(calibration::calibrate(raw, params))
    }

    fn impute(
        &self,
        raw: &RawSampleSet,
        tolerance_ms: f64,
    ) -> Result<ImputationOutcome, EngineError> {
        Ok(imputation::impute_gaps(raw, tolerance_ms))
    }

    fn epochs(&self, raw: &RawSampleSet, epoch_seconds: f64) -> Result<EpochSummary, EngineError> {
        epochs::aggregate(raw, epoch_seconds)
    }

    fn metric(&self, name: &str, raw: &RawSampleSet) -> Result<MetricSeries, EngineError> {
        metrics::compute_metric(name, raw)
    }

    fn score_epoch_counts(
        &self,
        algorithm: &str,
        variant: Option<&str>,
        counts: &[f64],
    ) -> Result<SleepScoreSeries, EngineError> {
        sleep::score_epoch_counts(algorithm, variant, counts)
    }

    fn sustained_inactivity(
        &self,
        raw: &RawSampleSet,
        params: &SibParams,
    ) -> Result<SleepScoreSeries, EngineError> {
        sleep::sustained_inactivity(raw, params)
    }

    fn detect_sleep_window(
        &self,
        raw: &RawSampleSet,
        params: &SleepWindowParams,
    ) -> Result<Option<SleepWindow>, EngineError> {
        sleep::detect_sleep_window(raw, params)
    }

    fn signal_nonwear(
        &self,
        raw: &RawSampleSet,
        params: &SignalNonwearParams,
    ) -> Result<NonwearSeries, EngineError> {
        nonwear::detect_signal_nonwear(raw, params)
    }

    fn count_nonwear(
        &self,
        counts: &[f64],
        params: &CountNonwearParams,
    ) -> Result<NonwearSeries, EngineError> {
        nonwear::detect_count_nonwear(counts, params)
    }

    fn capacitive_nonwear(
        &self,
        raw: &RawSampleSet,
        epoch_seconds: f64,
    ) -> Result<NonwearSeries, EngineError> {
        nonwear::detect_capacitive_nonwear(raw, epoch_seconds)
    }

    fn active_window_metrics(
        &self,
        values: &[f64],
        epoch_seconds: f64,
        window_hours: f64,
    ) -> Result<CircadianMetrics, EngineError> {
        circadian::active_window_metrics(values, epoch_seconds, window_hours)
    }

    fn variability_indices(
        &self,
        values: &[f64],
        timestamps: &[i64],
    ) -> Result<CircadianMetrics, EngineError> {
        circadian::variability_indices(values, timestamps)
    }

    fn cohens_kappa(&self, a: &[u8], b: &[u8]) -> Result<f64, EngineError> {
        circadian::cohens_kappa(a, b)
    }
}

/// The accelerated implementation: vectorized numeric kernels for the hot
/// stages only. Always registered so callers can name it, but only
/// available when the crate is built with the `native` feature.
pub struct NativeBackend;

impl NativeBackend {
    fn unsupported<T>(&self, capability: Capability) -> Result<T, EngineError> {
        Err(EngineError::Unsupported {
            backend: self.name(),
            capability,
        })
    }
}

#[cfg(feature = "native")]
mod native_kernels {
    use super::*;
    use ndarray::{azip, Array1, ArrayView1};

    pub fn epochs(raw: &RawSampleSet, epoch_seconds: f64) -> Result<EpochSummary, EngineError> {
        let spe = (raw.sample_rate * epoch_seconds).round() as usize;
        if spe == 0 {
            return Err(EngineError::EmptyInput("epoch aggregation"));
        }
        let n_epochs = raw.len() / spe;
        if n_epochs == 0 {
            return Err(EngineError::NotEnoughSamples {
                got: raw.len(),
                need: spe,
            });
        }
        let lim = n_epochs * spe;
        let x = ArrayView1::from(&raw.x[..lim]);
        let y = ArrayView1::from(&raw.y[..lim]);
        let z = ArrayView1::from(&raw.z[..lim]);

        let mut magnitude = Array1::<f64>::zeros(lim);
        azip!((m in &mut magnitude, &x in &x, &y in &y, &z in &z) {
            *m = (x * x + y * y + z * z).sqrt();
        });

        let chunk_sums = |v: ArrayView1<f64>, absolute: bool| -> Vec<f64> {
            v.exact_chunks(spe)
                .into_iter()
                .map(|c| {
                    if absolute {
                        c.iter().map(|v| v.abs()).sum()
                    } else {
                        c.sum()
                    }
                })
                .collect()
        };

        Ok(EpochSummary {
            x_counts: chunk_sums(x, true),
            y_counts: chunk_sums(y, true),
            z_counts: chunk_sums(z, true),
            magnitude_counts: chunk_sums(magnitude.view(), false),
            timestamps: (0..n_epochs).map(|e| raw.timestamps[e * spe]).collect(),
            epoch_seconds,
        })
    }

    pub fn metric(name: &str, raw: &RawSampleSet) -> Result<MetricSeries, EngineError> {
        if raw.is_empty() {
            return Err(EngineError::EmptyInput("metric computation"));
        }
        if name != "enmo" {
            // The filtered variants and angle share the portable path.
            return metrics::compute_metric(name, raw);
        }
        let x = ArrayView1::from(&raw.x[..]);
        let y = ArrayView1::from(&raw.y[..]);
        let z = ArrayView1::from(&raw.z[..]);
        let mut out = Array1::<f64>::zeros(raw.len());
        azip!((o in &mut out, &x in &x, &y in &y, &z in &z) {
            *o = ((x * x + y * y + z * z).sqrt() - 1.0).max(0.0);
        });
        Ok(MetricSeries {
            name: name.to_string(),
            values: out.to_vec(),
            timestamps: Some(raw.timestamps.clone()),
            params: serde_json::json!({}),
        })
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_available(&self) -> bool {
        cfg!(feature = "native")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
            .with(Capability::Calibrate)
            .with(Capability::Epoch)
            .with(Capability::Metrics)
    }

    fn read_device_file(
        &self,
        _path: &Path,
        _include_aux: bool,
    ) -> Result<RawSampleSet, EngineError> {
        self.unsupported(Capability::ParseDevice)
    }

    fn calibrate(
        &self,
        raw: &RawSampleSet,
        params: &CalibrationParams,
    ) -> Result<CalibrationOutcome, EngineError> {
        #[cfg(feature = "native")]
        {
            // The sphere fit already runs on ndarray matrices; both
            // backends share the one solver.
            return Ok(calibration::calibrate(raw, params));
        }
        #[cfg(not(feature = "native"))]
        {
            let _ = (raw, params);
            Err(EngineError::BackendUnavailable(self.name().to_string()))
        }
    }

    fn impute(
        &self,
        _raw: &RawSampleSet,
        _tolerance_ms: f64,
    ) -> Result<ImputationOutcome, EngineError> {
        self.unsupported(Capability::Impute)
    }

    fn epochs(&self, raw: &RawSampleSet, epoch_seconds: f64) -> Result<EpochSummary, EngineError> {
        #[cfg(feature = "native")]
        {
            return native_kernels::epochs(raw, epoch_seconds);
        }
        #[cfg(not(feature = "native"))]
        {
            let _ = (raw, epoch_seconds);
            Err(EngineError::BackendUnavailable(self.name().to_string()))
        }
    }

    fn metric(&self, name: &str, raw: &RawSampleSet) -> Result<MetricSeries, EngineError> {
        #[cfg(feature = "native")]
        {
            return native_kernels::metric(name, raw);
        }
        #[cfg(not(feature = "native"))]
        {
            let _ = (name, raw);
            Err(EngineError::BackendUnavailable(self.name().to_string()))
        }
    }

    fn score_epoch_counts(
        &self,
        _algorithm: &str,
        _variant: Option<&str>,
        _counts: &[f64],
    ) -> Result<SleepScoreSeries, EngineError> {
        self.unsupported(Capability::SleepEpochScoring)
    }

    fn sustained_inactivity(
        &self,
        _raw: &RawSampleSet,
        _params: &SibParams,
    ) -> Result<SleepScoreSeries, EngineError> {
        self.unsupported(Capability::SleepRawScoring)
    }

    fn detect_sleep_window(
        &self,
        _raw: &RawSampleSet,
        _params: &SleepWindowParams,
    ) -> Result<Option<SleepWindow>, EngineError> {
        self.unsupported(Capability::SleepWindowDetection)
    }

    fn signal_nonwear(
        &self,
        _raw: &RawSampleSet,
        _params: &SignalNonwearParams,
    ) -> Result<NonwearSeries, EngineError> {
        self.unsupported(Capability::Nonwear)
    }

    fn count_nonwear(
        &self,
        _counts: &[f64],
        _params: &CountNonwearParams,
    ) -> Result<NonwearSeries, EngineError> {
        self.unsupported(Capability::Nonwear)
    }

    fn capacitive_nonwear(
        &self,
        _raw: &RawSampleSet,
        _epoch_seconds: f64,
    ) -> Result<NonwearSeries, EngineError> {
        self.unsupported(Capability::Nonwear)
    }

    fn active_window_metrics(
        &self,
        _values: &[f64],
        _epoch_seconds: f64,
        _window_hours: f64,
    ) -> Result<CircadianMetrics, EngineError> {
        self.unsupported(Capability::Circadian)
    }

    fn variability_indices(
        &self,
        _values: &[f64],
        _timestamps: &[i64],
    ) -> Result<CircadianMetrics, EngineError> {
        self.unsupported(Capability::Circadian)
    }

    fn cohens_kappa(&self, _a: &[u8], _b: &[u8]) -> Result<f64, EngineError> {
        self.unsupported(Capability::Agreement)
    }
}

/// One registry row: identifier, presentation fields, selection priority
/// (lower wins) and the backend factory.
pub struct BackendEntry {
    pub id: &'static str,
    pub display_name: &'static str,
    pub priority: u32,
    pub description: &'static str,
    factory: fn() -> Box<dyn Backend>,
}

impl BackendEntry {
    pub fn instantiate(&self) -> Box<dyn Backend> {
        (self.factory)()
    }

    pub fn is_available(&self) -> bool {
        self.instantiate().is_available()
    }
}

/// Immutable backend registry, built exactly once at first use and
/// read-only afterwards.
pub struct Registry {
    entries: Vec<BackendEntry>,
}

/// Builder enforcing unique identifiers before the registry freezes.
pub struct RegistryBuilder {
    entries: Vec<BackendEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(mut self, entry: BackendEntry) -> Result<Self, EngineError> {
        if self.entries.iter().any(|e| e.id == entry.id) {
            return Err(EngineError::DuplicateBackend(entry.id.to_string()));
        }
        self.entries.push(entry);
        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            entries: self.entries,
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    fn with_builtin() -> Self {
        RegistryBuilder::new()
            .register(BackendEntry {
                id: "native",
                display_name: "Native (vectorized)",
                priority: 0,
                description: "ndarray-vectorized kernels for the hot numeric stages",
                factory: || Box::new(NativeBackend),
            })
            .and_then(|b| {
                b.register(BackendEntry {
                    id: "reference",
                    display_name: "Portable reference",
                    priority: 10,
                    description: "pure-Rust implementation of every pipeline operation",
                    factory: || Box::new(ReferenceBackend),
                })
            })
            .expect("builtin backend ids are unique")
            .build()
    }

    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    /// Instantiate a backend. With an id: that backend or a typed
    /// unknown/unavailable error. Without: the available entry with the
    /// lowest priority value, ties resolved by registration order.
    pub fn create(&self, id: Option<&str>) -> Result<Box<dyn Backend>, EngineError> {
        match id {
            Some(id) => {
                let entry = self
                    .entries
                    .iter()
                    .find(|e| e.id == id)
                    .ok_or_else(|| EngineError::UnknownBackend(id.to_string()))?;
                let backend = entry.instantiate();
                if !backend.is_available() {
                    return Err(EngineError::BackendUnavailable(id.to_string()));
                }
                Ok(backend)
            }
            None => self
                .entries
                .iter()
                .filter(|e| e.is_available())
                .min_by_key(|e| e.priority)
                .map(|e| e.instantiate())
                .ok_or(EngineError::NoBackends),
        }
    }

    /// Entries that are both available and support the capability.
    pub fn backends_with_capability(&self, cap: Capability) -> Vec<&BackendEntry> {
        self.entries
            .iter()
            .filter(|e| {
                let backend = e.instantiate();
                backend.is_available() && backend.supports(cap)
            })
            .collect()
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry, populated before first use and immutable
/// for the rest of the process lifetime.
pub fn global() -> &'static Registry {
    REGISTRY.get_or_init(Registry::with_builtin)
}
