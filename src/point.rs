//! Measurement points and their tag/field collections
//!
//! A point is one or more measured values sharing a destination namespace,
//! a measurement name and a timestamp. Tags identify the source and other
//! categorical properties; fields carry the measured data itself. All string
//! content is validated at construction so the rest of the pipeline can
//! assume wire-safe input.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// A single measured value
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Tag keys, field keys and measurement names share the same shape rules.
/// Lines are newline-separated on the wire, and names starting with an
/// underscore are reserved by the backend.
fn validate_key(key: &str, what: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidPoint(format!(
            "{what} must have a length of at least one character"
        )));
    }
    if key.contains('\n') {
        return Err(Error::InvalidPoint(format!(
            "Newline characters are not allowed in {}",
            what.to_lowercase()
        )));
    }
    if key.starts_with('_') {
        return Err(Error::InvalidPoint(format!(
            "{what} cannot start with an underscore character"
        )));
    }
    Ok(())
}

/// An insertion-ordered set of tags with unique keys
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TagSet {
    pairs: Vec<(String, String)>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tag set from key-value pairs, validating each
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (k, v) in pairs {
            set.insert(k, v)?;
        }
        Ok(set)
    }

    /// Insert a tag, replacing any existing value for the same key in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_key(&key, "Tag key")?;
        if value.is_empty() {
            return Err(Error::InvalidPoint(
                "Tag values must have a length of at least one character".to_string(),
            ));
        }
        if value.contains('\n') {
            return Err(Error::InvalidPoint(
                "Newline characters are not allowed in tag values".to_string(),
            ));
        }
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((key, value)),
        }
        Ok(())
    }

    /// Insert a tag that was already validated as part of an existing point.
    pub(crate) fn insert_unchecked(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The tags as a key-sorted list, the canonical form used for series and
    /// coalescing keys
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.pairs.clone();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// An insertion-ordered set of fields with unique keys
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldSet {
    pairs: Vec<(String, FieldValue)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a field set from key-value pairs, validating each
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let mut set = Self::new();
        for (k, v) in pairs {
            set.insert(k, v)?;
        }
        Ok(set)
    }

    /// Insert a field, replacing any existing value for the same key in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_key(&key, "Field key")?;
        match &value {
            FieldValue::Float(f) if !f.is_finite() => {
                return Err(Error::InvalidPoint(
                    "Float field values must be finite".to_string(),
                ));
            }
            FieldValue::Text(s) if s.contains('\n') => {
                return Err(Error::InvalidPoint(
                    "Newline characters are not allowed in field values".to_string(),
                ));
            }
            _ => {}
        }
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((key, value)),
        }
        Ok(())
    }

    /// Insert a field whose key and value were already validated as part of
    /// an existing point. Used when re-assembling reduced field sets.
    pub(crate) fn insert_unchecked(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One telemetry sample: a namespace, a measurement, an optional timestamp,
/// tags and at least one field.
///
/// A missing timestamp means the receiving system assigns the time at which
/// it consumes the point.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    namespace: Namespace,
    measurement: String,
    time: Option<DateTime<Utc>>,
    tags: TagSet,
    fields: FieldSet,
}

impl Point {
    pub fn new(
        namespace: Namespace,
        measurement: impl Into<String>,
        time: Option<DateTime<Utc>>,
        tags: TagSet,
        fields: FieldSet,
    ) -> Result<Self> {
        let measurement = measurement.into();
        validate_key(&measurement, "Measurement name")?;
        if fields.is_empty() {
            return Err(Error::InvalidPoint(
                "A point must carry at least one field".to_string(),
            ));
        }
        if let Some(t) = time {
            if t.timestamp_nanos_opt().is_none() {
                return Err(Error::InvalidPoint(
                    "Timestamp is outside the representable nanosecond range".to_string(),
                ));
            }
        }
        Ok(Self {
            namespace,
            measurement,
            time,
            tags,
            fields,
        })
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.time
    }

    /// Timestamp as integer nanoseconds since the epoch, truncated toward zero
    pub fn time_ns(&self) -> Option<i64> {
        self.time.and_then(|t| t.timestamp_nanos_opt())
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    /// Assemble a point from parts that were already validated, e.g. when a
    /// buffer re-materializes coalesced entries.
    pub(crate) fn new_unchecked(
        namespace: Namespace,
        measurement: String,
        time: Option<DateTime<Utc>>,
        tags: TagSet,
        fields: FieldSet,
    ) -> Self {
        debug_assert!(!fields.is_empty());
        Self {
            namespace,
            measurement,
            time,
            tags,
            fields,
        }
    }

    /// Copy of this point carrying only the given fields.
    /// Used by the duplicate filter; `fields` must not be empty.
    pub(crate) fn with_fields(&self, fields: FieldSet) -> Self {
        debug_assert!(!fields.is_empty());
        Self {
            namespace: self.namespace.clone(),
            measurement: self.measurement.clone(),
            time: self.time,
            tags: self.tags.clone(),
            fields,
        }
    }
}
