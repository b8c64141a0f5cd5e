use crate::epochs::EpochSummary;
use crate::{NonwearSeries, RawSampleSet, SleepScoreSeries};
use anyhow::Result;
use chrono::DateTime;
use polars::prelude::*;
use std::path::Path;

/// Write epoch-level results to CSV. The sleep and nonwear columns are
/// only written when their series align with the epoch grid; detectors
/// that run on a different cadence report through the printed summary
/// instead.
pub fn write_epoch_csv(
    base_path: &str,
    stem_id: &str,
    epochs: &EpochSummary,
    sleep: Option<&SleepScoreSeries>,
    nonwear: Option<&NonwearSeries>,
) -> Result<()> {
    let path = Path::new(base_path);
    let dir = path.parent().unwrap_or(Path::new("."));

    // Create directory if it doesn't exist
    std::fs::create_dir_all(dir)?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");

    let filename = format!("{}_{}_epochs.{}", stem, stem_id, ext);
    let full_path = dir.join(filename);

    println!("Writing epoch results to {}", full_path.display());
    let file = std::fs::File::create(full_path)?;
    let mut writer = csv::Writer::from_writer(file);

    let sleep = sleep.filter(|s| s.scores.len() == epochs.len());
    let nonwear = nonwear.filter(|n| n.flags.len() == epochs.len());

    let mut header = vec!["timestamp", "x_counts", "y_counts", "z_counts", "magnitude"];
    if sleep.is_some() {
        header.push("sleep");
    }
    if nonwear.is_some() {
        header.push("nonwear");
    }
    writer.write_record(&header)?;

    for i in 0..epochs.len() {
        let timestamp = DateTime::from_timestamp_millis(epochs.timestamps[i])
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let mut record = vec![
            timestamp,
            format!("{:.6}", epochs.x_counts[i]),
            format!("{:.6}", epochs.y_counts[i]),
            format!("{:.6}", epochs.z_counts[i]),
            format!("{:.6}", epochs.magnitude_counts[i]),
        ];
        if let Some(sleep) = sleep {
            record.push(sleep.scores[i].to_string());
        }
        if let Some(nonwear) = nonwear {
            record.push((nonwear.flags[i] as u8).to_string());
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

/// View a sample set as a polars DataFrame with a datetime-typed
/// timestamp column, for callers that work tabularly (and for the
/// column-detecting calibration path).
pub fn samples_to_frame(raw: &RawSampleSet) -> PolarsResult<DataFrame> {
    let timestamps = Series::new("timestamp".into(), raw.timestamps.clone())
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
    let mut df = df!(
        "accel_x" => raw.x.clone(),
        "accel_y" => raw.y.clone(),
        "accel_z" => raw.z.clone(),
    )?;
    df.insert_column(0, timestamps)?;
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{apply_calibration_frame, CalibrationOutcome};

    fn raw() -> RawSampleSet {
        RawSampleSet {
            x: vec![0.1, 0.2],
            y: vec![0.3, 0.4],
            z: vec![0.9, 1.0],
            timestamps: vec![1_700_000_000_000, 1_700_000_000_033],
            sample_rate: 30.0,
            metadata: None,
            light: None,
            battery: None,
            wear: None,
        }
    }

    #[test]
    fn frame_conversion_keeps_columns() {
        let df = samples_to_frame(&raw()).unwrap();
        assert_eq!(df.height(), 2);
        assert!(df.column("timestamp").is_ok());
        assert!(df.column("accel_x").is_ok());
    }

    #[test]
    fn frame_feeds_the_tabular_calibration_path() {
        let df = samples_to_frame(&raw()).unwrap();
        let outcome = CalibrationOutcome {
            success: true,
            scale: [1.0, 1.0, 2.0],
            offset: [0.0, 0.0, 0.0],
            error_before: 0.0,
            error_after: 0.0,
            points_used: 12,
            status: String::new(),
        };
        let calibrated = apply_calibration_frame(&df, &outcome).unwrap();
        let z: Vec<f64> = calibrated
            .column("accel_z")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(z, vec![1.8, 2.0]);
    }
}
