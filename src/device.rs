use crate::{DeviceMetadata, EngineError, RawSampleSet};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use zip::ZipArchive;

const INFO_ENTRY: &str = "info.txt";
const SAMPLES_ENTRY: &str = "samples.bin";
const LIGHT_ENTRY: &str = "lux.bin";
const BATTERY_ENTRY: &str = "battery.bin";
const WEAR_ENTRY: &str = "wear.bin";

/// Bits per packed sample value in the accelerometer stream.
const SAMPLE_BITS: usize = 12;

fn format_err(path: &Path, detail: impl Into<String>) -> EngineError {
    EngineError::Format {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, EngineError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            EngineError::Io(e)
        }
    })?;
    ZipArchive::new(BufReader::new(file))
        .map_err(|e| format_err(path, format!("not a readable archive: {}", e)))
}

fn read_entry(
    archive: &mut ZipArchive<BufReader<File>>,
    path: &Path,
    name: &str,
) -> Result<Vec<u8>, EngineError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| format_err(path, format!("missing '{}' entry", name)))?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .map_err(|e| format_err(path, format!("failed reading '{}': {}", name, e)))?;
    Ok(buf)
}

/// Parse the plain-text metadata record. Lines are "Key: Value"; unknown
/// keys are ignored so newer firmware revisions stay readable.
fn parse_info(path: &Path, text: &str) -> Result<DeviceMetadata, EngineError> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim(), value.trim());
        }
    }

    let required = |key: &str| -> Result<&str, EngineError> {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| format_err(path, format!("info record missing '{}'", key)))
    };

    let sample_rate: f64 = required("Sample Rate")?
        .parse()
        .map_err(|_| format_err(path, "unparsable 'Sample Rate'"))?;
    if sample_rate <= 0.0 {
        return Err(format_err(path, "sample rate must be positive"));
    }

    let start_ms: i64 = required("Start Date")?
        .parse()
        .map_err(|_| format_err(path, "unparsable 'Start Date'"))?;
    let start_time = DateTime::<Utc>::from_timestamp_millis(start_ms)
        .ok_or_else(|| format_err(path, "start date out of range"))?;

    let acceleration_scale: f64 = required("Acceleration Scale")?
        .parse()
        .map_err(|_| format_err(path, "unparsable 'Acceleration Scale'"))?;
    if acceleration_scale <= 0.0 {
        return Err(format_err(path, "acceleration scale must be positive"));
    }

    let timezone_offset_minutes = match fields.get("TimeZone") {
        Some(tz) => parse_timezone(tz).ok_or_else(|| format_err(path, "unparsable 'TimeZone'"))?,
        None => 0,
    };

    let sample_count = fields
        .get("Sample Count")
        .and_then(|v| v.parse::<u64>().ok());

    Ok(DeviceMetadata {
        serial: required("Serial Number")?.to_string(),
        device_type: fields.get("Device Type").unwrap_or(&"unknown").to_string(),
        sample_rate,
        start_time,
        timezone_offset_minutes,
        acceleration_scale,
        sample_count,
    })
}

/// Parse a "+HH:MM" / "-HH:MM" offset into minutes.
fn parse_timezone(tz: &str) -> Option<i32> {
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => (1, tz),
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    Some(sign * (hours * 60 + minutes))
}

/// Read one 12-bit big-endian value starting at the given bit offset.
/// Offsets advance in steps of 12, so `bit % 8` is always 0 or 4.
fn read_u12(bytes: &[u8], bit: usize) -> u16 {
    let byte = bit / 8;
    if bit % 8 == 0 {
        ((bytes[byte] as u16) << 4) | ((bytes[byte + 1] as u16) >> 4)
    } else {
        (((bytes[byte] as u16) & 0x0F) << 8) | bytes[byte + 1] as u16
    }
}

fn sign_extend_12(value: u16) -> i16 {
    ((value as i32) << 20 >> 20) as i16
}

/// Unpack the 12-bit x/y/z triplet stream into g units. Trailing bits
/// that do not form a whole triplet are ignored.
fn decode_samples(bytes: &[u8], scale: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = (bytes.len() * 8) / (SAMPLE_BITS * 3);
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut z = Vec::with_capacity(n);

    let mut bit = 0;
    for _ in 0..n {
        let xv = sign_extend_12(read_u12(bytes, bit));
        let yv = sign_extend_12(read_u12(bytes, bit + SAMPLE_BITS));
        let zv = sign_extend_12(read_u12(bytes, bit + 2 * SAMPLE_BITS));
        bit += 3 * SAMPLE_BITS;

        x.push(xv as f64 / scale);
        y.push(yv as f64 / scale);
        z.push(zv as f64 / scale);
    }

    (x, y, z)
}

fn decode_u16_le(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

fn optional_entry(
    archive: &mut ZipArchive<BufReader<File>>,
    path: &Path,
    name: &str,
) -> Result<Option<Vec<u8>>, EngineError> {
    if archive.by_name(name).is_err() {
        return Ok(None);
    }
    read_entry(archive, path, name).map(Some)
}

/// Fast path: decode only the metadata record, never touching the sample
/// streams. Used for file indexing and the inspector binary.
pub fn read_metadata(path: &Path) -> Result<DeviceMetadata, EngineError> {
    let mut archive = open_archive(path)?;
    let info = read_entry(&mut archive, path, INFO_ENTRY)?;
    let text = String::from_utf8(info)
        .map_err(|_| format_err(path, "info record is not valid UTF-8"))?;
    parse_info(path, &text)
}

/// Full decode: metadata plus the accelerometer stream, and optionally the
/// auxiliary light/battery/wear channels.
pub fn read_device_file(path: &Path, include_aux: bool) -> Result<RawSampleSet, EngineError> {
    let mut archive = open_archive(path)?;

    let info = read_entry(&mut archive, path, INFO_ENTRY)?;
    let text = String::from_utf8(info)
        .map_err(|_| format_err(path, "info record is not valid UTF-8"))?;
    let metadata = parse_info(path, &text)?;

    let raw = read_entry(&mut archive, path, SAMPLES_ENTRY)?;
    let (x, y, z) = decode_samples(&raw, metadata.acceleration_scale);
    if x.is_empty() {
        return Err(format_err(path, "sample stream holds no complete samples"));
    }
    if let Some(expected) = metadata.sample_count {
        if expected as usize != x.len() {
            return Err(format_err(
                path,
                format!(
                    "sample count mismatch: info says {}, stream holds {}",
                    expected,
                    x.len()
                ),
            ));
        }
    }

    // Timestamps are synthesized from the recorded start time; the device
    // stream itself carries no per-sample clock.
    let start_ms = metadata.start_time.timestamp_millis();
    let period = 1000.0 / metadata.sample_rate;
    let timestamps: Vec<i64> = (0..x.len())
        .map(|i| start_ms + (i as f64 * period).round() as i64)
        .collect();

    let mut light: Option<Vec<f64>> = None;
    let mut battery: Option<Vec<f64>> = None;
    let mut wear: Option<Vec<bool>> = None;
    if include_aux {
        if let Some(bytes) = optional_entry(&mut archive, path, LIGHT_ENTRY)? {
            light = Some(decode_u16_le(&bytes).into_iter().map(f64::from).collect());
        }
        if let Some(bytes) = optional_entry(&mut archive, path, BATTERY_ENTRY)? {
            battery = Some(
                decode_u16_le(&bytes)
                    .into_iter()
                    .map(|v| v as f64 / 1000.0)
                    .collect(),
            );
        }
        if let Some(bytes) = optional_entry(&mut archive, path, WEAR_ENTRY)? {
            wear = Some(bytes.into_iter().map(|v| v != 0).collect());
        }
    }

    debug!(
        "decoded {} samples at {} Hz from {} (aux: light={} battery={} wear={})",
        x.len(),
        metadata.sample_rate,
        path.display(),
        light.is_some(),
        battery.is_some(),
        wear.is_some()
    );

    let sample_rate = metadata.sample_rate;
    Ok(RawSampleSet {
        x,
        y,
        z,
        timestamps,
        sample_rate,
        metadata: Some(metadata),
        light,
        battery,
        wear,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Pack i16 values (must fit in 12 bits) into the MSB-first stream.
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

    fn write_container(
        path: &Path,
        info: &str,
        samples: &[i16],
        wear: Option<&[u8]>,
    ) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file(INFO_ENTRY, options).unwrap();
        zip.write_all(info.as_bytes()).unwrap();

        zip.start_file(SAMPLES_ENTRY, options).unwrap();
        zip.write_all(&pack_12bit(samples)).unwrap();

        if let Some(wear) = wear {
            zip.start_file(WEAR_ENTRY, options).unwrap();
            zip.write_all(wear).unwrap();
        }

        zip.finish().unwrap();
    }

    const INFO: &str = "Serial Number: ACT-0042\n\
        Device Type: wrist\n\
        Sample Rate: 30\n\
        Start Date: 1700000000000\n\
        TimeZone: +01:00\n\
        Acceleration Scale: 256\n";

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("actimetry-device-{}-{}", std::process::id(), name))
    }

    #[test]
    fn pack_and_decode_round_trip() {
        let values = [100i16, -100, 256, 0, 1, -1, 2047, -2048, 12, -7];
        // Nine values pack to 13.5 bytes; the final padded half-byte does
        // not yield a fourth triplet.
        let bytes = pack_12bit(&values[..9]);
        let (x, y, z) = decode_samples(&bytes, 256.0);
        assert_eq!(x.len(), 3);
        assert!((x[0] - 100.0 / 256.0).abs() < 1e-12);
        assert!((y[0] + 100.0 / 256.0).abs() < 1e-12);
        assert!((z[0] - 1.0).abs() < 1e-12);
        assert!((x[2] - 2047.0 / 256.0).abs() < 1e-12);
        assert!((y[2] + 2048.0 / 256.0).abs() < 1e-12);
    }

    #[test]
    fn metadata_fast_path() {
        let path = temp_path("meta.acc");
        write_container(&path, INFO, &[0, 0, 256], None);

        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.serial, "ACT-0042");
        assert_eq!(meta.sample_rate, 30.0);
        assert_eq!(meta.timezone_offset_minutes, 60);
        assert_eq!(meta.acceleration_scale, 256.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn full_decode_with_wear_channel() {
        let path = temp_path("full.acc");
        // Three samples: at rest with z = 1g.
        let samples = [0, 0, 256, 0, 0, 256, 0, 0, 256];
        write_container(&path, INFO, &samples, Some(&[1, 1, 0]));

        let raw = read_device_file(&path, true).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.x.len(), raw.timestamps.len());
        assert!((raw.z[0] - 1.0).abs() < 1e-12);
        assert_eq!(raw.wear.as_deref(), Some(&[true, true, false][..]));
        // 30 Hz -> ~33ms between samples.
        assert_eq!(raw.timestamps[1] - raw.timestamps[0], 33);

        let without_aux = read_device_file(&path, false).unwrap();
        assert!(without_aux.wear.is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = read_metadata(Path::new("/nonexistent/void.acc")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[test]
    fn garbage_file_is_format_error() {
        let path = temp_path("garbage.acc");
        std::fs::write(&path, b"not a zip at all").unwrap();
        let err = read_metadata(&path).unwrap_err();
        assert!(matches!(err, EngineError::Format { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_info_key_is_format_error() {
        let path = temp_path("nokey.acc");
        write_container(&path, "Serial Number: X\nSample Rate: 30\n", &[0, 0, 256], None);
        let err = read_metadata(&path).unwrap_err();
        match err {
            EngineError::Format { detail, .. } => assert!(detail.contains("Start Date")),
            other => panic!("expected format error, got {:?}", other),
        }
        std::fs::remove_file(&path).ok();
    }
}
