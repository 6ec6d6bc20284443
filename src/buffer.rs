//! Namespace-keyed point buffering
//!
//! Aggregates incoming points per destination namespace, coalescing entries
//! that share a (measurement, timestamp, tagset) key, and keeps an exact
//! running count of the serialized payload size. A buffer is flushed into a
//! telemessage when appending would push it over `max_batch_bytes`, when the
//! combined size of all buffers exceeds `max_total_buffer_bytes`, or when a
//! background linger task notices the buffer has outlived `linger_time_s`.
//!
//! A single point larger than `max_batch_bytes` is still accepted and goes
//! out as one oversized message; it is never dropped here.

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::error::Result;
use crate::lineproto::{encode_component_len, encode_field_value, encode_point, escape_measurement};
use crate::namespace::Namespace;
use crate::point::{FieldSet, Point, TagSet};
use crate::telemessage::Telemessage;
use crate::writer::{PointWriter, TelemessageWriter};

/// Coalescing key: points sharing it merge into one output line
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PointKey {
    measurement: String,
    time_ns: Option<i64>,
    /// key-sorted tag pairs
    tags: Vec<(String, String)>,
}

impl PointKey {
    fn of(point: &Point) -> Self {
        Self {
            measurement: point.measurement().to_string(),
            time_ns: point.time_ns(),
            tags: point.tags().sorted_pairs(),
        }
    }

    /// Serialized length of the comma-joined tag pairs
    fn tag_line_len(&self) -> usize {
        if self.tags.is_empty() {
            return 0;
        }
        let pairs: usize = self
            .tags
            .iter()
            .map(|(k, v)| encode_component_len(k) + 1 + encode_component_len(v))
            .sum();
        pairs + self.tags.len() - 1
    }
}

/// All points buffered for one namespace since the last flush
struct PointBuffer {
    namespace: Namespace,
    created_at: Instant,
    entries: HashMap<PointKey, FieldSet>,
    nr_bytes: usize,
}

impl PointBuffer {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            created_at: Instant::now(),
            entries: HashMap::new(),
            nr_bytes: 0,
        }
    }

    /// Exact change in serialized payload size if `point` were appended now.
    /// Negative when a replacement field value is shorter than the old one.
    fn extra_bytes_if_appended(&self, key: &PointKey, point: &Point) -> i64 {
        let mut extra: i64 = 0;
        let existing = self.entries.get(key);
        if existing.is_none() {
            extra += escape_measurement(&key.measurement).len() as i64;
            if !key.tags.is_empty() {
                extra += 1 + key.tag_line_len() as i64;
            }
            if let Some(ts) = key.time_ns {
                let mut buffer = itoa::Buffer::new();
                extra += 1 + buffer.format(ts).len() as i64;
            }
            if !self.entries.is_empty() {
                // the joining newline in the eventual payload
                extra += 1;
            }
        }
        for (field_key, value) in point.fields().iter() {
            let new_len = encode_field_value(value).len() as i64;
            match existing.and_then(|e| e.get(field_key)) {
                Some(old) => extra += new_len - encode_field_value(old).len() as i64,
                None => extra += 1 + encode_component_len(field_key) as i64 + 1 + new_len,
            }
        }
        extra
    }

    /// Merge a point into the buffer, field-wise last-write-wins
    fn append(&mut self, point: &Point) {
        let key = PointKey::of(point);
        let delta = self.extra_bytes_if_appended(&key, point);
        self.nr_bytes = (self.nr_bytes as i64 + delta) as usize;
        let entry = self.entries.entry(key).or_default();
        for (field_key, value) in point.fields().iter() {
            entry.insert_unchecked(field_key, value.clone());
        }
    }

    fn to_points(&self) -> Vec<Point> {
        self.entries
            .iter()
            .map(|(key, fields)| {
                let mut tags = TagSet::new();
                for (k, v) in &key.tags {
                    tags.insert_unchecked(k.clone(), v.clone());
                }
                let time = key.time_ns.map(DateTime::from_timestamp_nanos);
                Point::new_unchecked(
                    self.namespace.clone(),
                    key.measurement.clone(),
                    time,
                    tags,
                    fields.clone(),
                )
            })
            .collect()
    }

    fn to_telemessage(&self) -> Telemessage {
        let lines: Vec<String> = self.to_points().iter().map(encode_point).collect();
        Telemessage::from_lines(self.namespace.params(), lines)
    }
}

struct BufferState {
    buffers: HashMap<Namespace, PointBuffer>,
    total_bytes: usize,
}

fn drain_all(st: &mut BufferState) -> Vec<Telemessage> {
    let messages = st.buffers.values().map(PointBuffer::to_telemessage).collect();
    st.buffers.clear();
    st.total_bytes = 0;
    messages
}

/// Buffers points per namespace and hands coalesced telemessages downstream
pub struct BufferedPointWriter<W> {
    output: Arc<W>,
    config: BufferConfig,
    state: Arc<Mutex<BufferState>>,
    has_new: Arc<Notify>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<W: TelemessageWriter + 'static> BufferedPointWriter<W> {
    /// Create the writer and start its linger task.
    /// Must be called within a tokio runtime.
    pub fn new(output: W, config: BufferConfig) -> Self {
        let output = Arc::new(output);
        let state = Arc::new(Mutex::new(BufferState {
            buffers: HashMap::new(),
            total_bytes: 0,
        }));
        let has_new = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(linger_loop(
            Arc::clone(&state),
            Arc::clone(&output),
            Arc::clone(&has_new),
            Arc::clone(&shutdown),
            Duration::from_secs_f64(config.linger_time_s),
        ));
        Self {
            output,
            config,
            state,
            has_new,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Combined serialized size of all buffered content
    pub fn buffered_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Stop the linger task, draining buffered content downstream first
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    async fn write_messages(&self, messages: Vec<Telemessage>) {
        for message in messages {
            if let Err(e) = self.output.write_telemessage(message).await {
                warn!(error = %e, "Failed to write telemessage from point buffer");
            }
        }
    }
}

#[async_trait]
impl<W: TelemessageWriter + 'static> PointWriter for BufferedPointWriter<W> {
    async fn write_points(&self, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let messages = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut messages = Vec::new();
            for point in &points {
                let namespace = point.namespace().clone();
                let buffer = st
                    .buffers
                    .entry(namespace.clone())
                    .or_insert_with(|| PointBuffer::new(namespace.clone()));
                let key = PointKey::of(point);
                if buffer.nr_bytes > 0
                    && buffer.nr_bytes as i64 + buffer.extra_bytes_if_appended(&key, point)
                        > self.config.max_batch_bytes as i64
                {
                    messages.push(buffer.to_telemessage());
                    st.total_bytes -= buffer.nr_bytes;
                    *buffer = PointBuffer::new(namespace);
                }
                let before = buffer.nr_bytes;
                buffer.append(point);
                st.total_bytes = (st.total_bytes as i64 + buffer.nr_bytes as i64 - before as i64)
                    as usize;
            }
            if st.total_bytes > self.config.max_total_buffer_bytes {
                messages.extend(drain_all(st));
            } else {
                self.has_new.notify_one();
            }
            messages
        };
        self.write_messages(messages).await;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let messages = {
            let mut guard = self.state.lock();
            drain_all(&mut guard)
        };
        self.write_messages(messages).await;
        self.output.flush().await
    }
}

/// Flushes buffers that have outlived the linger time and sleeps until the
/// next deadline, a new-content signal, or shutdown.
async fn linger_loop<W: TelemessageWriter>(
    state: Arc<Mutex<BufferState>>,
    output: Arc<W>,
    has_new: Arc<Notify>,
    shutdown: Arc<Notify>,
    linger: Duration,
) {
    debug!("Point buffer linger task started");
    loop {
        let (messages, next_deadline) = {
            let mut guard = state.lock();
            let st = &mut *guard;
            let now = Instant::now();
            let due: Vec<Namespace> = st
                .buffers
                .iter()
                .filter(|(_, b)| now.saturating_duration_since(b.created_at) >= linger)
                .map(|(ns, _)| ns.clone())
                .collect();
            let mut messages = Vec::new();
            for namespace in due {
                if let Some(buffer) = st.buffers.remove(&namespace) {
                    st.total_bytes -= buffer.nr_bytes;
                    messages.push(buffer.to_telemessage());
                }
            }
            let next_deadline = st.buffers.values().map(|b| b.created_at + linger).min();
            (messages, next_deadline)
        };
        for message in messages {
            if let Err(e) = output.write_telemessage(message).await {
                warn!(error = %e, "Failed to write telemessage from linger task");
            }
        }
        tokio::select! {
            biased;

            _ = shutdown.notified() => {
                let messages = {
                    let mut guard = state.lock();
                    drain_all(&mut guard)
                };
                for message in messages {
                    if let Err(e) = output.write_telemessage(message).await {
                        warn!(error = %e, "Failed to write telemessage during buffer shutdown");
                    }
                }
                break;
            }
            _ = has_new.notified() => {}
            _ = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    debug!("Point buffer linger task stopped");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::point::FieldValue;
    use chrono::{TimeZone, Utc};

    /// Records every telemessage it receives
    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<Telemessage>>,
    }

    #[async_trait]
    impl TelemessageWriter for Arc<RecordingSink> {
        async fn write_telemessage(&self, message: Telemessage) -> Result<()> {
            self.messages.lock().push(message);
            Ok(())
        }
    }

    fn ns() -> Namespace {
        Namespace::v1("db", "rp").unwrap()
    }

    fn point(
        measurement: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, FieldValue)],
        time_s: Option<i64>,
    ) -> Point {
        let tags = TagSet::from_pairs(tags.iter().cloned()).unwrap();
        let fields = FieldSet::from_pairs(fields.iter().cloned()).unwrap();
        let time = time_s.map(|s| Utc.timestamp_opt(s, 0).unwrap());
        Point::new(ns(), measurement, time, tags, fields).unwrap()
    }

    fn payload_len(buffer: &PointBuffer) -> usize {
        buffer.to_telemessage().nr_bytes()
    }

    #[test]
    fn test_byte_accounting_matches_serialized_size() {
        let mut buffer = PointBuffer::new(ns());
        let points = [
            point("m", &[("id", "a")], &[("f", FieldValue::Integer(1))], Some(100)),
            point("m", &[("id", "b")], &[("f", FieldValue::Float(2.5))], Some(100)),
            point("m", &[], &[("g", FieldValue::Bool(true))], None),
            // same key as the first point: coalesces, replaces f, adds h
            point(
                "m",
                &[("id", "a")],
                &[("f", FieldValue::Integer(12345)), ("h", "text".into())],
                Some(100),
            ),
            // replacement shorter than the old value
            point("m", &[("id", "a")], &[("f", FieldValue::Integer(2))], Some(100)),
        ];
        for p in &points {
            buffer.append(p);
            assert_eq!(buffer.nr_bytes, payload_len(&buffer));
        }
        assert_eq!(buffer.entries.len(), 3);
    }

    #[test]
    fn test_coalescing_merges_disjoint_fields() {
        let mut buffer = PointBuffer::new(ns());
        buffer.append(&point(
            "m",
            &[("id", "a")],
            &[("temp", FieldValue::Float(18.0))],
            Some(100),
        ));
        buffer.append(&point(
            "m",
            &[("id", "a")],
            &[("humidity", FieldValue::Float(20.0))],
            Some(100),
        ));
        let msg = buffer.to_telemessage();
        let body = String::from_utf8(msg.data.to_vec()).unwrap();
        assert!(!body.contains('\n'));
        assert!(body.contains("temp=18.0"));
        assert!(body.contains("humidity=20.0"));
    }

    #[tokio::test]
    async fn test_flush_on_batch_cap_produces_multiple_messages() {
        let sink = Arc::new(RecordingSink::default());
        let config = BufferConfig {
            linger_time_s: 60.0,
            max_batch_bytes: 40,
            ..BufferConfig::default()
        };
        let writer = BufferedPointWriter::new(Arc::clone(&sink), config);
        let points: Vec<Point> = (0..6)
            .map(|i| {
                point(
                    "measurement",
                    &[],
                    &[("f", FieldValue::Integer(i))],
                    Some(100 + i),
                )
            })
            .collect();
        writer.write_points(points).await.unwrap();
        writer.flush().await.unwrap();

        let messages = sink.messages.lock();
        assert!(messages.len() >= 2, "expected >= 2 messages, got {}", messages.len());
        for msg in messages.iter() {
            assert!(msg.nr_bytes() <= 40);
        }
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_point_is_emitted_not_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let config = BufferConfig {
            linger_time_s: 60.0,
            max_batch_bytes: 10,
            ..BufferConfig::default()
        };
        let writer = BufferedPointWriter::new(Arc::clone(&sink), config);
        let big = point(
            "a_rather_long_measurement_name",
            &[],
            &[("f", FieldValue::Integer(1))],
            Some(100),
        );
        writer.write_points(vec![big]).await.unwrap();
        // A second oversized point evicts the first as its own message.
        writer.write_points(vec![point(
            "another_long_measurement_name",
            &[],
            &[("f", FieldValue::Integer(2))],
            Some(200),
        )])
        .await
        .unwrap();
        writer.flush().await.unwrap();

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].nr_bytes() > 10);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_total_cap_flushes_everything() {
        let sink = Arc::new(RecordingSink::default());
        let config = BufferConfig {
            linger_time_s: 60.0,
            max_batch_bytes: 1_000,
            max_total_buffer_bytes: 30,
        };
        let writer = BufferedPointWriter::new(Arc::clone(&sink), config);
        let p1 = point("m1", &[], &[("f", FieldValue::Integer(1))], Some(100));
        let p2 = Point::new(
            Namespace::v1("other", "rp").unwrap(),
            "m2",
            Some(Utc.timestamp_opt(100, 0).unwrap()),
            TagSet::new(),
            FieldSet::from_pairs([("f", FieldValue::Integer(2))]).unwrap(),
        )
        .unwrap();
        writer.write_points(vec![p1, p2]).await.unwrap();

        assert_eq!(sink.messages.lock().len(), 2);
        assert_eq!(writer.buffered_bytes(), 0);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_linger_flushes_single_point() {
        let sink = Arc::new(RecordingSink::default());
        let config = BufferConfig {
            linger_time_s: 0.05,
            ..BufferConfig::default()
        };
        let writer = BufferedPointWriter::new(Arc::clone(&sink), config);
        writer
            .write_points(vec![point("m", &[], &[("f", FieldValue::Integer(1))], Some(100))])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(sink.messages.lock().len(), 1);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffers() {
        let sink = Arc::new(RecordingSink::default());
        let config = BufferConfig {
            linger_time_s: 60.0,
            ..BufferConfig::default()
        };
        let writer = BufferedPointWriter::new(Arc::clone(&sink), config);
        writer
            .write_points(vec![point("m", &[], &[("f", FieldValue::Integer(1))], Some(100))])
            .await
            .unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(sink.messages.lock().len(), 1);
    }
}
