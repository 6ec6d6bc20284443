//! Telemetry messages
//!
//! A telemessage is a prepared request payload: the newline-joined
//! line-protocol body, the query parameters addressing a single namespace,
//! and any extra headers (content encoding). It is the unit of transmission,
//! retry and snapshotting.

use bytes::Bytes;
use std::collections::BTreeMap;

/// A block of telemetry lines transmitted as a single request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Telemessage {
    /// Query parameters added to the post request, corresponding to exactly
    /// one namespace
    pub parameters: BTreeMap<String, String>,
    /// Newline-joined line-protocol payload
    pub data: Bytes,
    /// Extra request headers, e.g. a content encoding
    pub headers: BTreeMap<String, String>,
}

impl Telemessage {
    pub fn new(parameters: BTreeMap<String, String>, data: Bytes) -> Self {
        Self {
            parameters,
            data,
            headers: BTreeMap::new(),
        }
    }

    /// Build a telemessage by joining encoded lines with newlines
    pub fn from_lines<L>(parameters: BTreeMap<String, String>, lines: L) -> Self
    where
        L: IntoIterator,
        L::Item: AsRef<[u8]>,
    {
        let mut data = Vec::new();
        for (i, line) in lines.into_iter().enumerate() {
            if i > 0 {
                data.push(b'\n');
            }
            data.extend_from_slice(line.as_ref());
        }
        Self::new(parameters, Bytes::from(data))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Payload size in bytes
    pub fn nr_bytes(&self) -> usize {
        self.data.len()
    }
}
