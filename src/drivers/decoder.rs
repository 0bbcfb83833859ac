use crate::drivers::error::{DecodeError, DecodeFault};
use crate::types::{Channel, Sample, FIELD_NAMES};

/// Number of comma-separated fields on one wire line.
pub const FIELD_COUNT: usize = 1 + Channel::COUNT;

/// Decodes one line of device output into a [`Sample`].
///
/// Fields are comma separated with optional surrounding whitespace. The first
/// is an integer millisecond timestamp, the remaining 13 are floats in wire
/// order. Values are not range checked; only parse failures are rejected.
pub fn decode(raw_line: &str) -> Result<Sample, DecodeError> {
    let line = raw_line.trim();
    if line.is_empty() {
        return Err(DecodeError::new(DecodeFault::Empty, raw_line));
    }
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(DecodeError::new(
            DecodeFault::FieldCount {
                expected: FIELD_COUNT,
                actual: fields.len(),
            },
            raw_line,
        ));
    }
    let timestamp_ms = fields[0]
        .parse::<i64>()
        .map_err(|_| not_a_number(0, fields[0], raw_line))?;
    let mut values = [0.0f64; Channel::COUNT];
    for (slot, (position, text)) in values.iter_mut().zip(fields.iter().enumerate().skip(1)) {
        *slot = parse_float(text).ok_or_else(|| not_a_number(position, text, raw_line))?;
    }
    Ok(Sample::from_values(timestamp_ms, values))
}

// `f64::from_str` also accepts "nan" and "inf"; those are not readings.
fn parse_float(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn not_a_number(position: usize, text: &str, raw_line: &str) -> DecodeError {
    DecodeError::new(
        DecodeFault::NotANumber {
            field: FIELD_NAMES[position],
            value: text.to_string(),
        },
        raw_line,
    )
}
