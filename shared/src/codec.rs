//! Sensor payload and CSV codec
//!
//! The peripheral notifies plain text readings:
//! ```text
//! <temperature>,<pressure>
//! ```
//!
//! Recorded samples are exported as CSV with a fixed layout:
//! ```text
//! Time,UTC Time,Oil Pressure,Oil Temperature
//! <elapsed %.3f>,<unix seconds>,<pressure %.3f>,<temperature %.3f>
//! ```

use thiserror::Error;

/// Header row of every exported CSV file
pub const CSV_HEADER: &str = "Time,UTC Time,Oil Pressure,Oil Temperature";

/// Errors that can occur while decoding readings
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload contains no numeric fields: {0:?}")]
    NoNumericFields(String),
}

/// Decode a notified value as text, replacing invalid UTF-8 sequences
pub fn decode_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

/// Numeric fields carried by one payload
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
}

/// Parse a payload into a reading
///
/// Fields that do not parse as numbers are skipped, so positions refer to
/// the remaining numeric fields: the first is temperature, the second is
/// pressure.
pub fn parse_reading(payload: &str) -> Result<SensorReading, CodecError> {
    let values: Vec<f64> = payload
        .split(',')
        .filter_map(|field| field.trim().parse::<f64>().ok())
        .collect();

    if values.is_empty() {
        return Err(CodecError::NoNumericFields(payload.to_string()));
    }

    Ok(SensorReading {
        temperature: values.first().copied(),
        pressure: values.get(1).copied(),
    })
}

/// One recorded row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureSample {
    /// Seconds since the recording started
    pub elapsed_secs: f64,
    /// Unix timestamp in whole seconds
    pub utc_timestamp: i64,
    pub pressure: f64,
    pub temperature: f64,
}

/// Format a single CSV row (without line terminator)
pub fn encode_row(sample: &PressureSample) -> String {
    format!(
        "{:.3},{},{:.3},{:.3}",
        sample.elapsed_secs, sample.utc_timestamp, sample.pressure, sample.temperature
    )
}

/// Render a complete CSV document, header included
pub fn encode_csv(samples: &[PressureSample]) -> String {
    let mut csv = String::with_capacity(CSV_HEADER.len() + 1 + samples.len() * 32);
    csv.push_str(CSV_HEADER);
    csv.push('\n');
    for sample in samples {
        csv.push_str(&encode_row(sample));
        csv.push('\n');
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PressureSample {
        PressureSample {
            elapsed_secs: 1.23456,
            utc_timestamp: 1_767_225_600,
            pressure: 45.3,
            temperature: 72.1,
        }
    }

    #[test]
    fn test_decode_text_lossy() {
        assert_eq!(decode_text(b"72.1,45.3"), "72.1,45.3");
        assert_eq!(decode_text(&[0x37, 0xFF, 0x32]), "7\u{FFFD}2");
    }

    #[test]
    fn test_parse_reading() {
        let reading = parse_reading("72.1,45.3").expect("parse failed");
        assert_eq!(reading.temperature, Some(72.1));
        assert_eq!(reading.pressure, Some(45.3));

        let reading = parse_reading(" 80.0 , 12.5 ").expect("parse failed");
        assert_eq!(reading.temperature, Some(80.0));
        assert_eq!(reading.pressure, Some(12.5));
    }

    #[test]
    fn test_parse_partial_reading() {
        let reading = parse_reading("72.1").expect("parse failed");
        assert_eq!(reading.temperature, Some(72.1));
        assert_eq!(reading.pressure, None);

        // Non-numeric fields are skipped before positions are assigned
        let reading = parse_reading("abc,72.1,45.3").expect("parse failed");
        assert_eq!(reading.temperature, Some(72.1));
        assert_eq!(reading.pressure, Some(45.3));
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert!(matches!(
            parse_reading("---"),
            Err(CodecError::NoNumericFields(_))
        ));
        assert!(parse_reading("").is_err());
    }

    #[test]
    fn test_encode_row_format() {
        assert_eq!(encode_row(&sample()), "1.235,1767225600,45.300,72.100");
    }

    #[test]
    fn test_encode_csv_header_only() {
        assert_eq!(encode_csv(&[]), format!("{CSV_HEADER}\n"));
    }

    #[test]
    fn test_encode_csv_rows() {
        let csv = encode_csv(&[sample(), sample()]);
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.starts_with("Time,UTC Time,Oil Pressure,Oil Temperature\n"));
        assert!(csv.ends_with("1.235,1767225600,45.300,72.100\n"));
    }
}
