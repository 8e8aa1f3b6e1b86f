//! Numeric vector encoding and `KEY=value` field access.
//!
//! Messages are `;`-separated fields. Float vectors inside a field are
//! `,`-separated decimal numbers with a fixed number of decimals.

use std::fmt::Write as _;

use rlbridge_core::CodecError;
use tracing::debug;

/// Field separator inside one message.
pub const FIELD_SEPARATOR: char = ';';

/// Value separator inside a float vector.
pub const VALUE_SEPARATOR: char = ',';

// ---------------------------------------------------------------------------
// Vectors
// ---------------------------------------------------------------------------

/// Encode `values` as a comma-joined list with `precision` decimals each.
///
/// ```
/// use rlbridge_wire::codec::encode_vector;
/// assert_eq!(encode_vector(&[1.0, -0.5], 2), "1.00,-0.50");
/// assert_eq!(encode_vector(&[], 2), "");
/// ```
pub fn encode_vector(values: &[f32], precision: usize) -> String {
    let mut out = String::with_capacity(values.len() * (precision + 4));
    for value in values {
        append_value(&mut out, *value, precision);
    }
    out
}

/// Decode a comma-joined float list.
///
/// Segments are trimmed and empty segments skipped. A segment that does not
/// parse decodes to `0.0`; use [`try_decode_vector`] to reject it instead.
pub fn decode_vector(text: &str) -> Vec<f32> {
    segments(text)
        .map(|(index, segment)| {
            segment.parse::<f32>().unwrap_or_else(|_| {
                debug!(index, segment, "malformed number decoded as 0.0");
                0.0
            })
        })
        .collect()
}

/// Strict form of [`decode_vector`]: the first malformed segment is an error.
///
/// `index` in the error counts non-empty segments from zero.
pub fn try_decode_vector(text: &str) -> Result<Vec<f32>, CodecError> {
    segments(text)
        .map(|(index, segment)| {
            segment
                .parse::<f32>()
                .map_err(|_| CodecError::MalformedNumber {
                    index,
                    segment: segment.to_string(),
                })
        })
        .collect()
}

fn segments(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split(VALUE_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
}

/// Append one value to a comma-joined state string.
pub fn append_value(state: &mut String, value: f32, precision: usize) {
    if !state.is_empty() {
        state.push(VALUE_SEPARATOR);
    }
    // Writing to a String cannot fail.
    let _ = write!(state, "{value:.precision$}");
}

/// Append several values to a comma-joined state string.
///
/// ```
/// use rlbridge_wire::codec::{append_field, append_value};
/// let mut state = String::new();
/// append_field(&mut state, &[1.0, 2.0], 1);
/// append_value(&mut state, 3.25, 2);
/// assert_eq!(state, "1.0,2.0,3.25");
/// ```
pub fn append_field(state: &mut String, values: &[f32], precision: usize) {
    for value in values {
        append_value(state, *value, precision);
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

fn fields(message: &str) -> impl Iterator<Item = &str> {
    message.split(FIELD_SEPARATOR).map(str::trim)
}

/// Value of the first field whose key is exactly `tag`.
///
/// Keys are case-sensitive and must start the field, so `ENV` does not
/// match inside `ENV_COUNT=4` or `XENV=1`. Returns `None` when absent.
///
/// ```
/// use rlbridge_wire::codec::extract_tag;
/// assert_eq!(extract_tag("ENV=2;ACT=0.1,0.2", "ACT"), Some("0.1,0.2"));
/// assert_eq!(extract_tag("ENV_COUNT=4", "ENV"), None);
/// ```
pub fn extract_tag<'a>(message: &'a str, tag: &str) -> Option<&'a str> {
    fields(message).find_map(|field| {
        field
            .strip_prefix(tag)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::trim)
    })
}

/// Whether `message` contains a bare field equal to `name` (e.g. `RESET`).
pub fn has_flag(message: &str, name: &str) -> bool {
    fields(message).any(|field| field == name)
}

/// `message` with every field keyed `tag` removed. Empty fields are dropped.
pub fn strip_tag(message: &str, tag: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for field in fields(message) {
        if field.is_empty() || is_keyed(field, tag) {
            continue;
        }
        if !out.is_empty() {
            out.push(FIELD_SEPARATOR);
        }
        out.push_str(field);
    }
    out
}

fn is_keyed(field: &str, tag: &str) -> bool {
    field
        .strip_prefix(tag)
        .is_some_and(|rest| rest.starts_with('='))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
