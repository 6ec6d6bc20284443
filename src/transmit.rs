//! Background telemessage transmission
//!
//! Enqueueing a message never blocks the caller: a single worker task owns
//! all transmission, retrying failed sends from a schedule-ordered heap with
//! exponential backoff. When a snapshot folder is configured, pending
//! messages are periodically persisted to disk and recovered on startup, so
//! unsent telemetry survives a crash.
//!
//! There is exactly one in-flight request at any time; messages leave the
//! heap in scheduled order (sub id breaks ties), which means submission
//! order is not preserved across retries.

use chrono::{DateTime, Utc};
use reqwest::Client;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::AuthProvider;
use crate::config::TransmitterConfig;
use crate::error::Result;
use crate::snapshot;
use crate::telemessage::Telemessage;
use crate::writer::TelemessageWriter;

/// A queued telemessage plus its delivery bookkeeping
struct Wrapper {
    message: Telemessage,
    creation_dt: DateTime<Utc>,
    sub_id: u64,
    retry_nr: u32,
    scheduled: Instant,
}

impl PartialEq for Wrapper {
    fn eq(&self, other: &Self) -> bool {
        self.scheduled == other.scheduled && self.sub_id == other.sub_id
    }
}

impl Eq for Wrapper {}

impl PartialOrd for Wrapper {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Wrapper {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.scheduled
            .cmp(&other.scheduled)
            .then(self.sub_id.cmp(&other.sub_id))
    }
}

struct QueueState {
    /// Freshly enqueued, not yet on the heap
    new_messages: Vec<Wrapper>,
    /// Min-heap on (scheduled, sub_id)
    pending: BinaryHeap<Reverse<Wrapper>>,
    /// Identity of the message currently being transmitted, if any
    in_flight: Option<(DateTime<Utc>, u64)>,
    stopping: bool,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.new_messages.is_empty() && self.pending.is_empty() && self.in_flight.is_none()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    /// Wakes the worker on new messages and on stop
    wake: Notify,
    /// True whenever no message is queued or in flight
    empty: watch::Sender<bool>,
    config: TransmitterConfig,
    client: Client,
    auth: Option<Arc<dyn AuthProvider>>,
    sub_id: AtomicU64,
}

impl Shared {
    fn next_sub_id(&self) -> u64 {
        self.sub_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Writes telemessages to the ingress endpoint from a background worker
pub struct BackgroundTelemessageWriter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTelemessageWriter {
    /// Create the writer and start its worker task. When a snapshot folder
    /// is configured, messages left behind by a previous instance are
    /// recovered and scheduled for immediate transmission.
    /// Must be called within a tokio runtime.
    pub fn new(config: TransmitterConfig) -> Result<Self> {
        Self::with_auth_option(config, None)
    }

    pub fn with_auth(config: TransmitterConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
        Self::with_auth_option(config, Some(auth))
    }

    fn with_auth_option(
        config: TransmitterConfig,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .build()?;

        let mut new_messages = Vec::new();
        let mut max_sub_id = 0;
        if let Some(folder) = &config.snapshot_folder {
            let now = Instant::now();
            for recovered in snapshot::load_snapshots(folder) {
                max_sub_id = max_sub_id.max(recovered.sub_id);
                new_messages.push(Wrapper {
                    message: recovered.message,
                    creation_dt: recovered.creation_dt,
                    sub_id: recovered.sub_id,
                    retry_nr: 0,
                    scheduled: now,
                });
            }
            if !new_messages.is_empty() {
                debug!(count = new_messages.len(), "Recovered telemessage snapshots");
            }
        }

        let (empty, _) = watch::channel(new_messages.is_empty());
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                new_messages,
                pending: BinaryHeap::new(),
                in_flight: None,
                stopping: false,
            }),
            wake: Notify::new(),
            empty,
            config,
            client,
            auth,
            sub_id: AtomicU64::new(max_sub_id + 1),
        });
        let worker = tokio::spawn(worker_loop(Arc::clone(&shared)));
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Number of messages queued or awaiting a retry
    pub fn pending_count(&self) -> usize {
        let st = self.shared.state.lock();
        st.new_messages.len() + st.pending.len() + usize::from(st.in_flight.is_some())
    }

    /// Signal the worker to stop. Without a snapshot folder every remaining
    /// message gets one last transmission attempt; with one, all pending
    /// messages are snapshotted instead. When `blocking` is set the call
    /// waits for the worker to finish.
    pub async fn close(&self, blocking: bool) -> Result<()> {
        self.shared.state.lock().stopping = true;
        self.shared.wake.notify_one();
        if blocking {
            let worker = self.worker.lock().take();
            if let Some(worker) = worker {
                let _ = worker.await;
            }
        }
        Ok(())
    }

    /// Kill the worker immediately: no draining, no shutdown snapshot.
    /// Anything not yet snapshotted is lost, as in a crash.
    pub fn abort(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

#[async_trait]
impl TelemessageWriter for BackgroundTelemessageWriter {
    /// Enqueue a message for transmission; never blocks on the network
    async fn write_telemessage(&self, message: Telemessage) -> Result<()> {
        let wrapper = Wrapper {
            message,
            creation_dt: Utc::now(),
            sub_id: self.shared.next_sub_id(),
            retry_nr: 0,
            scheduled: Instant::now(),
        };
        {
            let mut st = self.shared.state.lock();
            st.new_messages.push(wrapper);
            self.shared.empty.send_replace(false);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Wait until every queued message is either acknowledged or dropped
    async fn flush(&self) -> Result<()> {
        let mut rx = self.shared.empty.subscribe();
        let _ = rx.wait_for(|empty| *empty).await;
        Ok(())
    }
}

enum SendOutcome {
    /// Acknowledged or permanently dropped
    Done,
    /// Transient failure, retry later
    Reschedule(String),
}

enum Action {
    Shutdown,
    Send(Wrapper),
    Wait(Option<Instant>),
}

async fn worker_loop(shared: Arc<Shared>) {
    debug!("Telemessage transmit worker started");
    let mut last_snapshot = Instant::now();
    loop {
        let action = {
            let mut guard = shared.state.lock();
            let st = &mut *guard;
            for wrapper in st.new_messages.drain(..) {
                st.pending.push(Reverse(wrapper));
            }
            if st.stopping {
                Action::Shutdown
            } else {
                let next_scheduled = st.pending.peek().map(|Reverse(top)| top.scheduled);
                match next_scheduled {
                    Some(scheduled) if scheduled <= Instant::now() => match st.pending.pop() {
                        Some(Reverse(wrapper)) => {
                            st.in_flight = Some((wrapper.creation_dt, wrapper.sub_id));
                            Action::Send(wrapper)
                        }
                        None => Action::Wait(None),
                    },
                    Some(scheduled) => Action::Wait(Some(scheduled)),
                    None => Action::Wait(None),
                }
            }
        };

        match action {
            Action::Shutdown => {
                shutdown_drain(&shared).await;
                break;
            }
            Action::Send(wrapper) => {
                let outcome = send_message(&shared, &wrapper).await;
                let mut st = shared.state.lock();
                st.in_flight = None;
                if let SendOutcome::Reschedule(reason) = outcome {
                    reschedule(&shared.config, &mut st, wrapper, &reason);
                }
                apply_heap_cap(&shared.config, &mut st);
                if st.is_empty() {
                    shared.empty.send_replace(true);
                }
            }
            Action::Wait(deadline) => {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = async {
                        match deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {}
                }
            }
        }

        if let Some(folder) = shared.config.snapshot_folder.clone() {
            if last_snapshot.elapsed() >= Duration::from_secs_f64(shared.config.snapshot_period_s)
            {
                snapshot_pass(&shared, &folder, false);
                last_snapshot = Instant::now();
            }
        }
    }
    debug!("Telemessage transmit worker stopped");
}

/// Transmit one message. Returns whether it is finished (success or
/// permanent drop) or should be rescheduled.
async fn send_message(shared: &Shared, wrapper: &Wrapper) -> SendOutcome {
    let mut params: BTreeMap<&str, &str> = shared
        .config
        .params
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    for (k, v) in &wrapper.message.parameters {
        params.insert(k, v);
    }
    let params: Vec<(&str, &str)> = params.into_iter().collect();

    let mut request = shared
        .client
        .post(&shared.config.url)
        .query(&params)
        .body(wrapper.message.data.clone());
    if let Some(auth) = &shared.auth {
        match auth.authorization_header().await {
            Ok(header) => request = request.header(reqwest::header::AUTHORIZATION, header),
            Err(e) => {
                error!(error = %e, "Dropping telemessage, unable to obtain an authorization header");
                return SendOutcome::Done;
            }
        }
    }
    for (key, value) in &wrapper.message.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    match request.send().await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let phrase = resp.status().canonical_reason().unwrap_or("");
            if status == 204 {
                SendOutcome::Done
            } else if shared.config.retry.should_retry_status(status) {
                let body = resp.text().await.unwrap_or_default();
                SendOutcome::Reschedule(format!(
                    "response with status code {status} ({phrase}): {body}"
                ))
            } else {
                let body = resp.text().await.unwrap_or_default();
                error!(
                    status,
                    phrase,
                    body = %body,
                    payload = %String::from_utf8_lossy(&wrapper.message.data),
                    "Dropping telemessage due to unexpected response"
                );
                SendOutcome::Done
            }
        }
        Err(e) if e.is_timeout() => SendOutcome::Reschedule("timeout".to_string()),
        Err(e) if e.is_connect() => SendOutcome::Reschedule("connection error".to_string()),
        Err(e) => {
            error!(error = %e, "Dropping telemessage due to unexpected error");
            SendOutcome::Done
        }
    }
}

/// Push a failed message back onto the heap with backoff, or drop it once
/// the retries are exhausted.
fn reschedule(config: &TransmitterConfig, st: &mut QueueState, mut wrapper: Wrapper, reason: &str) {
    if wrapper.retry_nr + 1 <= config.retry.max_retries {
        warn!(reason, "Retrying telemessage transmission");
        wrapper.scheduled = Instant::now() + config.retry.backoff(wrapper.retry_nr);
        wrapper.retry_nr += 1;
        st.pending.push(Reverse(wrapper));
    } else {
        error!(reason, "Maximum number of retries exceeded, dropping telemessage");
    }
}

/// Best-effort backpressure: when the heap exceeds the configured cap, the
/// tail of its backing array is truncated. This drops entries biased toward
/// later-scheduled messages, not in any strict order.
fn apply_heap_cap(config: &TransmitterConfig, st: &mut QueueState) {
    let Some(cap) = config.max_heap_size else {
        return;
    };
    if st.pending.len() > cap {
        let dropped = st.pending.len() - cap;
        let mut entries = std::mem::take(&mut st.pending).into_vec();
        entries.truncate(cap);
        st.pending = BinaryHeap::from(entries);
        warn!(dropped, "Pending telemessage heap over capacity, dropped tail entries");
    }
}

/// Persist pending messages and prune files for messages no longer pending.
/// `ignore_age` is set during graceful shutdown, where even young messages
/// must survive.
fn snapshot_pass(shared: &Shared, folder: &Path, ignore_age: bool) {
    let now = Utc::now();
    let (entries, in_flight) = {
        let st = shared.state.lock();
        let entries: Vec<(Telemessage, DateTime<Utc>, u64)> = st
            .new_messages
            .iter()
            .map(|w| (w.message.clone(), w.creation_dt, w.sub_id))
            .chain(
                st.pending
                    .iter()
                    .map(|Reverse(w)| (w.message.clone(), w.creation_dt, w.sub_id)),
            )
            .collect();
        (entries, st.in_flight)
    };

    let mut keep: HashSet<String> = entries
        .iter()
        .map(|(_, dt, id)| snapshot::snapshot_filename(*dt, *id))
        .collect();
    if let Some((dt, id)) = in_flight {
        // Not snapshotted, but its file must survive in case the send fails.
        keep.insert(snapshot::snapshot_filename(dt, id));
    }

    let min_age = chrono::Duration::milliseconds((shared.config.min_snapshot_age_s * 1e3) as i64);
    for (message, creation_dt, sub_id) in &entries {
        if ignore_age || now - *creation_dt >= min_age {
            if let Err(e) = snapshot::write_snapshot(folder, message, *creation_dt, *sub_id) {
                warn!(error = %e, "Unable to store a telemessage snapshot");
            }
        }
    }
    snapshot::prune_snapshots(folder, &keep);
}

/// Shutdown handling: snapshot everything when a folder is configured,
/// otherwise give every remaining message one final attempt.
async fn shutdown_drain(shared: &Shared) {
    match shared.config.snapshot_folder.clone() {
        Some(folder) => {
            snapshot_pass(shared, &folder, true);
        }
        None => {
            let remaining: Vec<Wrapper> = {
                let mut guard = shared.state.lock();
                let st = &mut *guard;
                let mut remaining: Vec<Wrapper> = st.new_messages.drain(..).collect();
                while let Some(Reverse(wrapper)) = st.pending.pop() {
                    remaining.push(wrapper);
                }
                remaining
            };
            for mut wrapper in remaining {
                // Force the retry counter to its cap so a failure cannot requeue
                wrapper.retry_nr = shared.config.retry.max_retries;
                if let SendOutcome::Reschedule(reason) = send_message(shared, &wrapper).await {
                    error!(reason, "Dropping telemessage during shutdown");
                }
            }
        }
    }
    {
        let mut st = shared.state.lock();
        st.new_messages.clear();
        st.pending.clear();
        st.in_flight = None;
    }
    shared.empty.send_replace(true);
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use bytes::Bytes;

    fn wrapper(sub_id: u64, scheduled: Instant) -> Wrapper {
        Wrapper {
            message: Telemessage::new(BTreeMap::new(), Bytes::from_static(b"m f=1i")),
            creation_dt: Utc::now(),
            sub_id,
            retry_nr: 0,
            scheduled,
        }
    }

    #[test]
    fn test_heap_orders_by_schedule_then_sub_id() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(wrapper(3, now + Duration::from_secs(5))));
        heap.push(Reverse(wrapper(2, now)));
        heap.push(Reverse(wrapper(1, now)));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(w)| w.sub_id)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_reschedule_applies_backoff_and_drops_after_cap() {
        let config = TransmitterConfig::new("http://localhost/ingest");
        let mut st = QueueState {
            new_messages: Vec::new(),
            pending: BinaryHeap::new(),
            in_flight: None,
            stopping: false,
        };

        let mut w = wrapper(1, Instant::now());
        w.retry_nr = 2;
        reschedule(&config, &mut st, w, "timeout");
        assert_eq!(st.pending.len(), 1);
        let Reverse(w) = st.pending.pop().unwrap();
        assert_eq!(w.retry_nr, 3);
        // third retry waits initial * 2^2 seconds
        assert!(w.scheduled > Instant::now() + Duration::from_secs(3));

        let mut exhausted = wrapper(2, Instant::now());
        exhausted.retry_nr = config.retry.max_retries;
        reschedule(&config, &mut st, exhausted, "timeout");
        assert!(st.pending.is_empty());
    }

    #[test]
    fn test_heap_cap_truncates_to_limit() {
        let mut config = TransmitterConfig::new("http://localhost/ingest");
        config.max_heap_size = Some(3);
        let mut st = QueueState {
            new_messages: Vec::new(),
            pending: BinaryHeap::new(),
            in_flight: None,
            stopping: false,
        };
        let now = Instant::now();
        for i in 0..10 {
            st.pending.push(Reverse(wrapper(i, now + Duration::from_secs(i))));
        }
        apply_heap_cap(&config, &mut st);
        assert_eq!(st.pending.len(), 3);
        // The earliest-scheduled message survives at the heap root.
        let Reverse(top) = st.pending.peek().unwrap();
        assert_eq!(top.sub_id, 0);
    }

    #[test]
    fn test_heap_cap_disabled_by_default() {
        let config = TransmitterConfig::new("http://localhost/ingest");
        let mut st = QueueState {
            new_messages: Vec::new(),
            pending: BinaryHeap::new(),
            in_flight: None,
            stopping: false,
        };
        let now = Instant::now();
        for i in 0..100 {
            st.pending.push(Reverse(wrapper(i, now)));
        }
        apply_heap_cap(&config, &mut st);
        assert_eq!(st.pending.len(), 100);
    }
}
