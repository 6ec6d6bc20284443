//! Point-duplicate suppression
//!
//! Keeps an in-memory record of the last value written for every
//! (namespace, measurement, tagset, field, timestamp) and drops incoming
//! field values that are identical to the recorded one. Fields that survive
//! are re-assembled into reduced points; points left without any field are
//! dropped entirely. Points without a timestamp always pass through.
//!
//! Memory is bounded three ways, applied on every write: entries older than
//! `max_entry_age_s` expire, a series never holds more than
//! `max_series_entry_count` timestamps, and the total entry count never
//! exceeds `max_entry_count` (least-recently-updated evicted first).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::FilterConfig;
use crate::error::Result;
use crate::point::{FieldSet, FieldValue, Point};
use crate::time::{Clock, SystemClock};
use crate::writer::PointWriter;

/// Identifies one time-indexed scalar stream
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    namespace_params: Vec<(String, String)>,
    measurement: String,
    tags: Vec<(String, String)>,
    field: String,
}

#[derive(Clone, Copy)]
struct EntryMeta {
    seq: u64,
    updated_ns: i64,
}

#[derive(Default)]
struct FilterState {
    /// series -> timestamp -> last seen value
    memory: HashMap<Arc<SeriesKey>, BTreeMap<i64, FieldValue>>,
    /// (series, timestamp) -> LRU bookkeeping
    entries: HashMap<(Arc<SeriesKey>, i64), EntryMeta>,
    /// update order -> (series, timestamp); the eviction queue
    lru: BTreeMap<u64, (Arc<SeriesKey>, i64)>,
    seq: u64,
}

impl FilterState {
    /// Record an update for (series, timestamp), moving it to the back of
    /// the eviction queue.
    fn touch(&mut self, series: &Arc<SeriesKey>, time_ns: i64, now_ns: i64) {
        self.seq += 1;
        let seq = self.seq;
        if let Some(meta) = self.entries.get_mut(&(Arc::clone(series), time_ns)) {
            self.lru.remove(&meta.seq);
            meta.seq = seq;
            meta.updated_ns = now_ns;
        } else {
            self.entries.insert(
                (Arc::clone(series), time_ns),
                EntryMeta {
                    seq,
                    updated_ns: now_ns,
                },
            );
        }
        self.lru.insert(seq, (Arc::clone(series), time_ns));
    }

    /// Remove one entry from all three structures
    fn delete(&mut self, series: &Arc<SeriesKey>, time_ns: i64) {
        if let Some(meta) = self.entries.remove(&(Arc::clone(series), time_ns)) {
            self.lru.remove(&meta.seq);
        }
        if let Some(values) = self.memory.get_mut(series) {
            values.remove(&time_ns);
            if values.is_empty() {
                self.memory.remove(series);
            }
        }
    }

    /// Drop every entry whose last update is at or before the threshold
    fn expire(&mut self, threshold_ns: i64) {
        loop {
            let front = self
                .lru
                .values()
                .next()
                .map(|(series, time_ns)| (Arc::clone(series), *time_ns));
            let Some((series, time_ns)) = front else { break };
            let updated = self
                .entries
                .get(&(Arc::clone(&series), time_ns))
                .map(|m| m.updated_ns)
                .unwrap_or(i64::MIN);
            if updated > threshold_ns {
                break;
            }
            self.delete(&series, time_ns);
        }
    }
}

/// Drops field values identical to the last cached value for their series
pub struct PointDuplicateFilter<W> {
    output: W,
    config: FilterConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<FilterState>,
}

impl<W: PointWriter> PointDuplicateFilter<W> {
    pub fn new(output: W, config: FilterConfig) -> Self {
        Self::with_clock(output, config, Arc::new(SystemClock))
    }

    pub fn with_clock(output: W, config: FilterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            output,
            config,
            clock,
            state: Mutex::new(FilterState::default()),
        }
    }

    /// Number of remembered (series, timestamp) entries
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of distinct series currently remembered
    pub fn series_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    fn filter_batch(&self, points: &[Point]) -> Vec<Point> {
        let mut state = self.state.lock();
        let now_ns = self.clock.now_nanos();
        state.expire(now_ns - (self.config.max_entry_age_s as i64) * 1_000_000_000);

        let mut out = Vec::new();
        for point in points {
            let Some(time_ns) = point.time_ns() else {
                // No timestamp: the receive time will differ per submission,
                // so there is nothing to deduplicate against.
                out.push(point.clone());
                continue;
            };
            let namespace_params: Vec<(String, String)> =
                point.namespace().params().into_iter().collect();
            let tags = point.tags().sorted_pairs();
            let mut updated = FieldSet::new();
            for (field_key, value) in point.fields().iter() {
                let series = Arc::new(SeriesKey {
                    namespace_params: namespace_params.clone(),
                    measurement: point.measurement().to_string(),
                    tags: tags.clone(),
                    field: field_key.to_string(),
                });
                let series = match state.memory.get_key_value(&series) {
                    Some((existing, _)) => Arc::clone(existing),
                    None => series,
                };
                state.touch(&series, time_ns, now_ns);
                let values = state.memory.entry(Arc::clone(&series)).or_default();
                if values.get(&time_ns) != Some(value) {
                    values.insert(time_ns, value.clone());
                    updated.insert_unchecked(field_key, value.clone());
                }
                while state
                    .memory
                    .get(&series)
                    .map(|v| v.len() > self.config.max_series_entry_count)
                    .unwrap_or(false)
                {
                    let oldest = state
                        .memory
                        .get(&series)
                        .and_then(|v| v.keys().next().copied());
                    match oldest {
                        Some(ts) => state.delete(&Arc::clone(&series), ts),
                        None => break,
                    }
                }
                while state.entries.len() > self.config.max_entry_count {
                    let victim = state
                        .lru
                        .values()
                        .next()
                        .map(|(s, ts)| (Arc::clone(s), *ts));
                    match victim {
                        Some((s, ts)) => state.delete(&s, ts),
                        None => break,
                    }
                }
            }
            if !updated.is_empty() {
                out.push(point.with_fields(updated));
            }
        }
        out
    }
}

#[async_trait]
impl<W: PointWriter> PointWriter for PointDuplicateFilter<W> {
    async fn write_points(&self, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let out = self.filter_batch(&points);
        if out.is_empty() {
            return Ok(());
        }
        self.output.write_points(out).await
    }

    async fn flush(&self) -> Result<()> {
        self.output.flush().await
    }
}
