//! Line-protocol encoding
//!
//! Serializes points into the backend's newline-separated text format:
//! `<measurement>[,<tagset>] <fieldset>[ <time_ns>]`. Escaping follows the
//! wire grammar: backslashes are doubled first, then the characters that
//! would be read as delimiters are escaped per position. Tag pairs are
//! emitted in sorted order of their escaped keys; field pairs keep their
//! insertion order. Integer and float rendering goes through itoa/ryu to
//! stay allocation-free on the hot path.

use bytes::Bytes;

use crate::point::{FieldSet, FieldValue, Point, TagSet};

/// Escape a measurement name. Commas and spaces delimit the tag section and
/// the field section; `=` is not special in this position.
pub fn escape_measurement(measurement: &str) -> String {
    measurement
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

/// Escape a tag key, tag value or field key. All three delimiters are
/// significant in these positions.
pub fn escape_component(component: &str) -> String {
    component
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Serialized length of an escaped key or tag value, without allocating.
/// Every escaped character is ASCII and gains exactly one backslash byte.
pub fn encode_component_len(component: &str) -> usize {
    component.len()
        + component
            .bytes()
            .filter(|b| matches!(b, b'\\' | b',' | b'=' | b' '))
            .count()
}

/// Render a field value in its wire form
pub fn encode_field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Bool(true) => "T".to_string(),
        FieldValue::Bool(false) => "F".to_string(),
        FieldValue::Integer(i) => {
            let mut buffer = itoa::Buffer::new();
            format!("{}i", buffer.format(*i))
        }
        FieldValue::Float(f) => {
            let mut buffer = ryu::Buffer::new();
            buffer.format(*f).to_string()
        }
        FieldValue::Text(s) => {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
    }
}

/// Comma-joined `key=value` pairs, sorted by escaped key
pub fn encode_tag_set(tags: &TagSet) -> String {
    let mut pairs: Vec<(String, String)> = tags
        .iter()
        .map(|(k, v)| (escape_component(k), escape_component(v)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    rendered.join(",")
}

/// Comma-joined `key=value` pairs in insertion order
pub fn encode_field_set(fields: &FieldSet) -> String {
    let rendered: Vec<String> = fields
        .iter()
        .map(|(k, v)| format!("{}={}", escape_component(k), encode_field_value(v)))
        .collect();
    rendered.join(",")
}

/// Encode one point as a single line-protocol line
pub fn encode_point(point: &Point) -> String {
    let mut line = escape_measurement(point.measurement());
    if !point.tags().is_empty() {
        line.push(',');
        line.push_str(&encode_tag_set(point.tags()));
    }
    line.push(' ');
    line.push_str(&encode_field_set(point.fields()));
    if let Some(ts) = point.time_ns() {
        let mut buffer = itoa::Buffer::new();
        line.push(' ');
        line.push_str(buffer.format(ts));
    }
    line
}

/// Encode a batch of points as a newline-joined payload
pub fn encode_points(points: &[Point]) -> Bytes {
    let lines: Vec<String> = points.iter().map(encode_point).collect();
    Bytes::from(lines.join("\n").into_bytes())
}
