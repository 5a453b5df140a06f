use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::stats::LatencyStats;
use crate::store::{decode, DocumentStore, StoreError, Subscription};
use crate::types::{system_time_msec, ExecutionPlan, PeerDoc, PeerId, PeerLog};

/// How far we have read one peer's ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub last_timestamp: u64,
    pub next_index: usize,
}

/// Per-peer read positions over every other peer's ring, plus the latency
/// accumulated from the records consumed so far.
#[derive(Debug)]
pub struct LogCursors {
    own_id: PeerId,
    log_size: usize,
    cursors: HashMap<PeerId, LogCursor>,
    stats: LatencyStats,
}

impl LogCursors {
    pub fn new(own_id: &str, log_size: usize) -> Self {
        Self {
            own_id: own_id.to_string(),
            log_size: log_size.max(1),
            cursors: HashMap::new(),
            stats: LatencyStats::new(),
        }
    }

    /// Fold every unread record in `doc`. Returns how many were consumed.
    pub fn process_doc(&mut self, doc: &PeerDoc, now_msec: u64) -> u64 {
        let mut consumed = 0;
        for (peer_id, log) in &doc.logs {
            if *peer_id == self.own_id {
                trace!(peer_id = %peer_id, "skipping own log");
                continue;
            }
            consumed += self.process_peer(peer_id, log, now_msec);
        }
        consumed
    }

    /// Read forward from the peer's cursor until an empty slot or a record older
    /// than the last one consumed. A pass never visits more than one full ring.
    pub fn process_peer(&mut self, peer_id: &str, log: &PeerLog, now_msec: u64) -> u64 {
        let mut cursor = self.cursors.get(peer_id).copied().unwrap_or_default();
        if cursor.last_timestamp == 0 {
            // nothing read yet: begin at the oldest record still retained
            cursor.next_index = oldest_slot(log, self.log_size).unwrap_or(0);
        }
        let mut consumed = 0;
        while consumed < self.log_size as u64 {
            let Some(rec) = log.slot(cursor.next_index) else {
                break;
            };
            // writers never repeat a timestamp, so equal means already consumed
            if rec.timestamp <= cursor.last_timestamp {
                break;
            }
            let latency = now_msec.saturating_sub(rec.timestamp);
            self.stats.record(latency);
            debug!(peer_id, index = cursor.next_index, latency, "consumed record");
            cursor.last_timestamp = rec.timestamp;
            cursor.next_index = (cursor.next_index + 1) % self.log_size;
            consumed += 1;
        }
        self.cursors.insert(peer_id.to_string(), cursor);
        consumed
    }

    pub fn cursor(&self, peer_id: &str) -> Option<LogCursor> {
        self.cursors.get(peer_id).copied()
    }

    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            distinct_peers: self.cursors.len(),
            ..self.stats.clone()
        }
    }
}

fn oldest_slot(log: &PeerLog, log_size: usize) -> Option<usize> {
    (0..log_size)
        .filter_map(|i| log.slot(i).map(|r| (r.timestamp, i)))
        .min()
        .map(|(_, i)| i)
}

/// Watches the shared peer document and folds other peers' records as they
/// arrive.
pub struct Consumer {
    store: Arc<dyn DocumentStore>,
    collection: String,
    doc_id: String,
    own_id: PeerId,
    state: Arc<Mutex<ConsumerState>>,
    task: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

struct ConsumerState {
    running: bool,
    cursors: LogCursors,
}

fn lock(state: &Mutex<ConsumerState>) -> MutexGuard<'_, ConsumerState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl Consumer {
    pub fn new(store: Arc<dyn DocumentStore>, own_id: &str, plan: &ExecutionPlan) -> Self {
        Self {
            store,
            collection: plan.peer_collection_name.clone(),
            doc_id: plan.peer_doc_id.clone(),
            own_id: own_id.to_string(),
            state: Arc::new(Mutex::new(ConsumerState {
                running: false,
                cursors: LogCursors::new(own_id, plan.peer_log_size),
            })),
            task: None,
            subscription: None,
        }
    }

    /// Make sure our own (empty) ring exists so other peers see us.
    fn ensure_peer_log(&self) -> Result<(), StoreError> {
        let existing = self.store.find_by_id(&self.collection, &self.doc_id)?;
        let present = existing
            .as_ref()
            .and_then(|doc| doc.get("logs"))
            .and_then(|logs| logs.get(&self.own_id))
            .is_some();
        if !present {
            self.store.update(
                &self.collection,
                &self.doc_id,
                &["logs", &self.own_id],
                json!({ "log": {} }),
            )?;
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), StoreError> {
        info!(
            peer_id = %self.own_id,
            collection = %self.collection,
            doc_id = %self.doc_id,
            "consumer start"
        );
        self.ensure_peer_log()?;
        self.subscription = Some(self.store.subscribe(&self.collection));
        lock(&self.state).running = true;

        let mut rx = self.store.observe(&self.collection);
        let state = self.state.clone();
        let doc_id = self.doc_id.clone();
        self.task = Some(tokio::spawn(async move {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(value) = snapshot.get(&doc_id) {
                    match decode::<PeerDoc>(value) {
                        Ok(doc) => {
                            let mut st = lock(&state);
                            if !st.running {
                                break;
                            }
                            st.cursors.process_doc(&doc, system_time_msec());
                        }
                        Err(e) => warn!(doc_id = %doc_id, error = %e, "undecodable peer document"),
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    /// Stop observing and return the accumulated latency. A fold already in
    /// progress finishes first.
    pub fn stop(&mut self) -> LatencyStats {
        let stats = {
            let mut st = lock(&self.state);
            st.running = false;
            st.cursors.stats()
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(sub) = self.subscription.take() {
            sub.cancel();
        }
        info!(
            peer_id = %self.own_id,
            events = stats.num_events,
            peers = stats.distinct_peers,
            "consumer stop"
        );
        stats
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
