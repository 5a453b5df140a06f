use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{encode, DocumentStore, StoreError};
use crate::types::{system_time_msec, ExecutionPlan, PeerId, PeerRecord};

/// Uniform message delay over `[min, max]` milliseconds, both inclusive.
pub struct Jitter {
    rng: StdRng,
    min_msec: u32,
    max_msec: u32,
}

impl Jitter {
    pub fn new(min_msec: u32, max_msec: u32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // swapped bounds would panic in gen_range
        let (min_msec, max_msec) = if min_msec <= max_msec {
            (min_msec, max_msec)
        } else {
            (max_msec, min_msec)
        };
        Self {
            rng,
            min_msec,
            max_msec,
        }
    }

    pub fn from_plan(plan: &ExecutionPlan, seed: Option<u64>) -> Self {
        Self::new(plan.min_msg_delay_msec, plan.max_msg_delay_msec, seed)
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(self.min_msec..=self.max_msec) as u64)
    }
}

struct Cursor {
    next: usize,
    last_timestamp: u64,
    written: u64,
    finished: bool,
}

/// Writes into this peer's own ring in the shared peer document.
struct RingWriter {
    store: Arc<dyn DocumentStore>,
    collection: String,
    doc_id: String,
    peer_id: PeerId,
    log_size: usize,
    cursor: Mutex<Cursor>,
}

impl RingWriter {
    /// Write the next record unless the producer was stopped. The finished flag,
    /// the write and the count share one lock so `stop` sees an exact count.
    fn write_next(&self) -> Result<bool, StoreError> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        if cursor.finished {
            return Ok(false);
        }
        let index = cursor.next;
        // strictly increasing per writer, so readers can tell wrapped slots apart
        let timestamp = system_time_msec().max(cursor.last_timestamp + 1);
        let record = PeerRecord {
            timestamp,
            data: format!("{}#{}", self.peer_id, cursor.written),
        };
        let slot = index.to_string();
        self.store.update(
            &self.collection,
            &self.doc_id,
            &["logs", &self.peer_id, "log", &slot],
            encode(&record)?,
        )?;
        debug!(peer_id = %self.peer_id, index, timestamp, "record produced");
        cursor.next = (index + 1) % self.log_size;
        cursor.last_timestamp = timestamp;
        cursor.written += 1;
        Ok(true)
    }

    fn finish(&self) -> u64 {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        cursor.finished = true;
        cursor.written
    }
}

pub struct Producer {
    writer: Arc<RingWriter>,
    task: Option<JoinHandle<()>>,
}

impl Producer {
    pub fn new(store: Arc<dyn DocumentStore>, peer_id: &str, plan: &ExecutionPlan) -> Self {
        let writer = RingWriter {
            store,
            collection: plan.peer_collection_name.clone(),
            doc_id: plan.peer_doc_id.clone(),
            peer_id: peer_id.to_string(),
            log_size: plan.peer_log_size.max(1),
            cursor: Mutex::new(Cursor {
                next: 0,
                last_timestamp: 0,
                written: 0,
                finished: false,
            }),
        };
        Self {
            writer: Arc::new(writer),
            task: None,
        }
    }

    /// Begin producing: one record per jittered delay until [`Producer::stop`].
    pub fn start(&mut self, mut jitter: Jitter) {
        info!(peer_id = %self.writer.peer_id, log_size = self.writer.log_size, "producer start");
        let writer = self.writer.clone();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(jitter.next_delay()).await;
                match writer.write_next() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(peer_id = %writer.peer_id, error = %e, "record write failed"),
                }
            }
        }));
    }

    /// Stop producing and return the number of records written. Safe to call
    /// more than once.
    pub fn stop(&mut self) -> u64 {
        let written = self.writer.finish();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        info!(peer_id = %self.writer.peer_id, written, "producer stop");
        written
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
