use actimetry::backend::{self, Backend, Capability};
use actimetry::epochs::Axis;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use zip::write::SimpleFileOptions;

/// Pack i16 values (12-bit range) into the container's MSB-first stream.
fn pack_12bit(values: &[i16]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &v in values {
        acc = (acc << 12) | ((v as u16) & 0x0FFF) as u32;
        bits += 12;
        while bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    if bits > 0 {
        out.push((acc << (8 - bits)) as u8);
    }
    out
}

fn write_container(path: &PathBuf, info: &str, samples: &[i16]) {
    let file = File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    zip.start_file("info.txt", options).unwrap();
    zip.write_all(info.as_bytes()).unwrap();

    zip.start_file("samples.bin", options).unwrap();
    zip.write_all(&pack_12bit(samples)).unwrap();

    zip.finish().unwrap();
}

const INFO: &str = "Serial Number: ACT-1207\n\
    Device Type: wrist\n\
    Sample Rate: 10\n\
    Start Date: 1700000000000\n\
    TimeZone: +00:00\n\
    Acceleration Scale: 256\n";

/// A half-hour recording at 10 Hz: at rest on the back except for two
/// short movement bursts.
fn synthetic_samples() -> Vec<i16> {
    let n = 10 * 1800;
    let mut triplets = Vec::with_capacity(n * 3);
    for i in 0..n {
        let burst = (3000..3100).contains(&i) || (12000..12100).contains(&i);
        if burst {
            let swing = if i % 2 == 0 { 300 } else { -300 };
            triplets.extend_from_slice(&[swing, 100, 200]);
        } else {
            triplets.extend_from_slice(&[0, 0, 256]);
        }
    }
    triplets
}

fn temp_container(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "actimetry-pipeline-{}-{}.acc",
        std::process::id(),
        name
    ));
    write_container(&path, INFO, &synthetic_samples());
    path
}

#[test]
fn metadata_fast_path_reads_the_info_record() {
    let path = temp_container("meta");
    let meta = actimetry::device::read_metadata(&path).unwrap();
    assert_eq!(meta.serial, "ACT-1207");
    assert_eq!(meta.sample_rate, 10.0);
    assert_eq!(meta.start_time.timestamp_millis(), 1_700_000_000_000);
    std::fs::remove_file(&path).ok();
}

#[test]
fn full_pipeline_through_a_registry_backend() {
    let path = temp_container("full");

    let parser = backend::global().create(None).unwrap();
    let reader = if parser.supports(Capability::ParseDevice) {
        parser
    } else {
        backend::global().create(Some("reference")).unwrap()
    };
    let raw = reader.read_device_file(&path, true).unwrap();
    assert_eq!(raw.len(), 18000);
    assert!((raw.z[0] - 1.0).abs() < 1e-9);

    // Calibration: a recording lying flat the whole time yields almost no
    // distinct stationary points, so this must reject with the identity
    // transform.
    let calibrated = reader
        .calibrate(&raw, &actimetry::calibration::CalibrationParams::default())
        .unwrap();
    assert!(!calibrated.success);
    assert_eq!(calibrated.scale, [1.0; 3]);
    assert_eq!(calibrated.offset, [0.0; 3]);

    // The synthesized timestamps are gap-free, so imputation must return
    // the input untouched.
    let imputed = reader.impute(&raw, 1000.0).unwrap();
    assert_eq!(imputed.gap_count, 0);
    assert_eq!(imputed.timestamps, raw.timestamps);
    assert_eq!(imputed.x, raw.x);

    // Epoch aggregation conserves activity mass.
    let epochs = reader.epochs(&raw, 60.0).unwrap();
    assert_eq!(epochs.len(), 30);
    let direct: f64 = raw.x.iter().map(|v| v.abs()).sum();
    let summed: f64 = epochs.counts(Axis::X).iter().sum();
    assert!((direct - summed).abs() < 1e-6);

    // ENMO is nonnegative and near zero at rest.
    let enmo = reader.metric("enmo", &raw).unwrap();
    assert!(enmo.values.iter().all(|&v| v >= 0.0));
    assert!(enmo.values[0] < 0.01);

    // Epoch-count scoring keeps the one-score-per-epoch contract.
    let scored = reader
        .score_epoch_counts("sadeh", Some("capped"), epochs.counts(Axis::Magnitude))
        .unwrap();
    assert_eq!(scored.scores.len(), epochs.len());

    // A rater always agrees with itself.
    let kappa = reader.cohens_kappa(&scored.scores, &scored.scores).unwrap();
    assert_eq!(kappa, 1.0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn sustained_inactivity_sees_the_bursts() {
    let path = temp_container("sib");
    let reader = backend::global().create(Some("reference")).unwrap();
    let raw = reader.read_device_file(&path, false).unwrap();

    let scored = reader
        .sustained_inactivity(&raw, &actimetry::sleep::SibParams::default())
        .unwrap();
    // 5s epochs over 30 minutes.
    assert_eq!(scored.scores.len(), 360);
    // The long still stretch between the two bursts is a sleep bout.
    assert_eq!(scored.scores[120], 1);
    // The burst around sample 12000 (epoch 240) is wake.
    assert_eq!(scored.scores[240], 0);

    std::fs::remove_file(&path).ok();
}
