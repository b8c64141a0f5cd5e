use actimetry::backend::{self, Backend, Capability};
use actimetry::calibration::{self, CalibrationParams};
use actimetry::config::{Args, NonwearChoice};
use actimetry::device;
use actimetry::epochs::Axis;
use actimetry::imputation;
use actimetry::nonwear::{CountNonwearParams, SignalNonwearParams};
use actimetry::sleep::{SibParams, SleepWindowParams};
use actimetry::{output, EngineError, NonwearSeries, SleepScoreSeries};
use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_backends {
        list_backends();
        return Ok(());
    }

    // Fail early if an explicitly requested backend cannot be created.
    let primary = backend::global().create(args.backend.as_deref())?;
    println!("Using backend: {}", primary.name());

    let files = discover_files(&args.input_path)?;
    if files.is_empty() {
        println!("No .acc files found under {}", args.input_path.display());
        return Ok(());
    }
    println!("Found {} container file(s)", files.len());

    // Files are independent pipeline runs; one bad file never aborts the
    // batch.
    let mut failures = 0;
    for path in &files {
        if let Err(e) = process_file(&args, path) {
            eprintln!("Error processing {}: {:#}", path.display(), e);
            failures += 1;
        }
    }
    if failures > 0 {
        println!("\n{} of {} file(s) failed", failures, files.len());
    }
    Ok(())
}

fn list_backends() {
    println!("Registered backends:");
    for entry in backend::global().entries() {
        let backend = entry.instantiate();
        println!(
            "  {} (priority {}) - {}: {} [{}]",
            entry.id,
            entry.priority,
            entry.display_name,
            entry.description,
            if backend.is_available() {
                "available"
            } else {
                "unavailable"
            }
        );
    }
}

fn discover_files(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(input) {
        let entry = entry?;
        let path = entry.path();
        let is_container = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("acc"))
            .unwrap_or(false);
        if entry.file_type().is_file() && is_container {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

/// Pick a backend for one operation: the explicitly requested backend if
/// it supports the capability, otherwise the highest-priority available
/// backend that does.
fn select(cap: Capability, preferred: Option<&str>) -> Result<Box<dyn Backend>, EngineError> {
    let registry = backend::global();
    if let Some(id) = preferred {
        let backend = registry.create(Some(id))?;
        if backend.supports(cap) {
            return Ok(backend);
        }
        debug!("backend '{}' lacks {:?}, falling back", id, cap);
    }
    registry
        .backends_with_capability(cap)
        .into_iter()
        .min_by_key(|e| e.priority)
        .map(|e| e.instantiate())
        .ok_or(EngineError::NoBackends)
}

fn process_file(args: &Args, path: &Path) -> Result<()> {
    println!("\nProcessing {}", path.display());

    if args.metadata_only {
        let meta = device::read_metadata(path)?;
        println!("  Serial: {}", meta.serial);
        println!("  Device type: {}", meta.device_type);
        println!("  Sample rate: {} Hz", meta.sample_rate);
        println!(
            "  Start: {} (UTC{:+03}:{:02})",
            meta.start_time.format("%Y-%m-%d %H:%M:%S"),
            meta.timezone_offset_minutes / 60,
            (meta.timezone_offset_minutes % 60).abs()
        );
        if let Some(count) = meta.sample_count {
            println!("  Samples: {}", count);
        }
        return Ok(());
    }

    let preferred = args.backend.as_deref();

    let parser = select(Capability::ParseDevice, preferred)?;
    let mut raw = parser.read_device_file(path, args.include_aux)?;
    println!(
        "  Decoded {} samples at {} Hz ({:.1} minutes)",
        raw.len(),
        raw.sample_rate,
        raw.len() as f64 / raw.sample_rate / 60.0
    );

    if !args.no_calibration {
        let cal = select(Capability::Calibrate, preferred)?;
        let outcome = cal.calibrate(&raw, &CalibrationParams::default())?;
        if outcome.success {
            println!(
                "  Calibration: error {:.5}g -> {:.5}g on {} stationary points",
                outcome.error_before, outcome.error_after, outcome.points_used
            );
            raw = calibration::apply_to_samples(&raw, &outcome);
        } else {
            // A data-dependent outcome, not a failure of the run.
            println!("  Calibration not applied: {}", outcome.status);
        }
    }

    if !args.no_imputation {
        let imputer = select(Capability::Impute, preferred)?;
        let outcome = imputer.impute(&raw, args.gap_tolerance_ms)?;
        if outcome.gap_count > 0 {
            println!(
                "  Imputed {} gap(s): {} samples added, {:.1}s missing",
                outcome.gap_count, outcome.samples_added, outcome.gap_seconds
            );
        }
        raw = imputation::to_sample_set(&outcome, &raw);
    }

    let aggregator = select(Capability::Epoch, preferred)?;
    let epochs = aggregator
        .epochs(&raw, args.epoch_length)
        .with_context(|| format!("aggregating {}s epochs", args.epoch_length))?;
    println!(
        "  {} epochs of {}s",
        epochs.len(),
        epochs.epoch_seconds
    );

    let metric_backend = select(Capability::Metrics, preferred)?;
    let enmo = metric_backend.metric("enmo", &raw)?;
    let mean_enmo = enmo.values.iter().sum::<f64>() / enmo.values.len() as f64;
    println!("  Mean ENMO: {:.4}g", mean_enmo);

    let sleep = score_sleep(args, &raw, epochs.counts(Axis::Magnitude))?;
    let asleep = sleep.scores.iter().filter(|&&s| s == 1).count();
    println!(
        "  Sleep ({}): {} of {} epochs scored asleep",
        sleep.algorithm,
        asleep,
        sleep.scores.len()
    );

    // Agreement against the other epoch-count scorer, when applicable.
    if args.sleep_algorithm.is_epoch_family() {
        let other = if args.sleep_algorithm.algorithm == "sadeh" {
            "cole-kripke"
        } else {
            "sadeh"
        };
        let scorer = select(Capability::SleepEpochScoring, preferred)?;
        let second = scorer.score_epoch_counts(other, None, epochs.counts(Axis::Magnitude))?;
        let agreement = select(Capability::Agreement, preferred)?;
        let kappa = agreement.cohens_kappa(&sleep.scores, &second.scores)?;
        println!("  Agreement with {}: kappa = {:.3}", other, kappa);
    }

    let window_detector = select(Capability::SleepWindowDetection, preferred)?;
    match window_detector.detect_sleep_window(&raw, &SleepWindowParams::default()) {
        Ok(Some(window)) => {
            println!(
                "  Sleep window: {} -> {} ({:.0} min asleep, {:.0} min WASO, {:.1}% efficiency)",
                window.onset.format("%Y-%m-%d %H:%M"),
                window.offset.format("%Y-%m-%d %H:%M"),
                window.minutes_asleep,
                window.minutes_awake_after_onset,
                window.efficiency_percent
            );
        }
        Ok(None) => println!("  Sleep window: none detected"),
        Err(EngineError::NotEnoughSamples { .. }) => {
            println!("  Sleep window: recording too short")
        }
        Err(e) => return Err(e.into()),
    }

    let nonwear = match detect_nonwear(args, &raw, epochs.counts(Axis::Magnitude)) {
        Ok(series) => {
            println!(
                "  Nonwear ({}): {} interval(s)",
                series.algorithm,
                series.ranges.len()
            );
            Some(series)
        }
        Err(EngineError::NotEnoughSamples { need, .. }) => {
            println!("  Nonwear: recording shorter than the detector window ({} samples)", need);
            None
        }
        Err(EngineError::EmptyInput(what)) => {
            println!("  Nonwear: skipped, no {}", what);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let circadian = select(Capability::Circadian, preferred)?;
    match circadian.active_window_metrics(
        epochs.counts(Axis::Magnitude),
        args.epoch_length,
        args.active_window_hours,
    ) {
        Ok(metrics) => {
            println!(
                "  Circadian: most-active mean {:.3}, least-active mean {:.3}, RA {:.3}",
                metrics.values["most_active_mean"],
                metrics.values["least_active_mean"],
                metrics.values["relative_amplitude"]
            );
        }
        Err(EngineError::NotEnoughSamples { .. }) => {
            println!(
                "  Circadian: recording shorter than the {}h window",
                args.active_window_hours
            );
        }
        Err(e) => return Err(e.into()),
    }
    match circadian.variability_indices(epochs.counts(Axis::Magnitude), &epochs.timestamps) {
        Ok(metrics) => println!(
            "  Variability: IS {:.3}, IV {:.3} over {:.0} hours",
            metrics.values["interdaily_stability"],
            metrics.values["intradaily_variability"],
            metrics.values["hours_observed"]
        ),
        Err(EngineError::NotEnoughSamples { .. }) => {
            println!("  Variability: needs at least two hours of data")
        }
        Err(e) => return Err(e.into()),
    }

    if let Some(prefix) = &args.csv_output {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        output::write_epoch_csv(prefix, stem, &epochs, Some(&sleep), nonwear.as_ref())?;
    }

    Ok(())
}

fn score_sleep(
    args: &Args,
    raw: &actimetry::RawSampleSet,
    counts: &[f64],
) -> Result<SleepScoreSeries> {
    let choice = &args.sleep_algorithm;
    if choice.is_epoch_family() {
        let scorer = select(Capability::SleepEpochScoring, args.backend.as_deref())?;
        Ok(scorer.score_epoch_counts(&choice.algorithm, choice.variant.as_deref(), counts)?)
    } else {
        let scorer = select(Capability::SleepRawScoring, args.backend.as_deref())?;
        Ok(scorer.sustained_inactivity(raw, &SibParams::default())?)
    }
}

fn detect_nonwear(
    args: &Args,
    raw: &actimetry::RawSampleSet,
    counts: &[f64],
) -> Result<NonwearSeries, EngineError> {
    let detector = select(Capability::Nonwear, args.backend.as_deref())?;
    match args.nonwear_algorithm {
        NonwearChoice::StddevRange => {
            let params = SignalNonwearParams::preset(&args.nonwear_preset)?;
            detector.signal_nonwear(raw, &params)
        }
        NonwearChoice::CountThreshold => {
            detector.count_nonwear(counts, &CountNonwearParams::default())
        }
        NonwearChoice::Capacitive => detector.capacitive_nonwear(raw, args.epoch_length),
    }
}
