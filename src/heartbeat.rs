use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::context::{with_deadline, PeerError, PeerHandle};
use crate::store::{encode, observe_until, DocumentId, DocumentStore, StoreError};
use crate::types::{system_time_msec, Heartbeat};

/// Writes this peer's heartbeat entry into the shared heartbeat document.
#[derive(Clone)]
pub struct HeartbeatSender {
    store: Arc<dyn DocumentStore>,
    collection: String,
    doc_id: DocumentId,
    peer: PeerHandle,
}

impl HeartbeatSender {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: &str,
        doc_id: DocumentId,
        peer: PeerHandle,
    ) -> Self {
        Self {
            store,
            collection: collection.to_string(),
            doc_id,
            peer,
        }
    }

    /// One timer tick. Returns whether a heartbeat was written; once the peer is
    /// past `Ready` this is a no-op.
    pub fn send(&self) -> Result<bool, StoreError> {
        let state = self.peer.state();
        if !state.is_bootstrapping() {
            trace!(peer_id = %self.peer.id, %state, "heartbeat suppressed");
            return Ok(false);
        }
        let hb = Heartbeat {
            sender: self.peer.to_serialized_peer(),
            sent_at_msec: system_time_msec(),
        };
        debug!(peer_id = %self.peer.id, %state, "heartbeat send");
        self.store.update(
            &self.collection,
            &self.doc_id,
            &["beats", &self.peer.id],
            encode(&hb)?,
        )?;
        Ok(true)
    }
}

/// Find the heartbeat document in `collection`, waiting for the coordinator to
/// create it if needed.
pub async fn locate_heartbeat_doc(
    store: &dyn DocumentStore,
    collection: &str,
    limit: Option<Duration>,
) -> Result<DocumentId, PeerError> {
    let _sub = store.subscribe(collection);
    let mut rx = store.observe(collection);
    let found = with_deadline(limit, "heartbeat document", async {
        observe_until(&mut rx, |docs| {
            if docs.len() > 1 {
                warn!(collection, count = docs.len(), "multiple heartbeat documents, using first");
            }
            Ok::<_, PeerError>(docs.keys().next().cloned())
        })
        .await
    })
    .await??;
    found.ok_or(PeerError::ObserverClosed("heartbeat document"))
}

/// Repeating heartbeat timer. Dropping it also stops the timer.
pub struct HeartbeatTimer {
    task: Option<JoinHandle<()>>,
}

impl HeartbeatTimer {
    pub fn start(sender: HeartbeatSender, period: Duration) -> Self {
        info!(peer_id = %sender.peer.id, period_ms = period.as_millis() as u64, "heartbeat start");
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                // not retried; the next tick overwrites anyway
                if let Err(e) = sender.send() {
                    error!(peer_id = %sender.peer.id, error = %e, "heartbeat write failed");
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("heartbeat timer cancelled");
            task.abort();
        }
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerSettings;
    use crate::context::PeerContext;
    use crate::store::{decode, MemoryStore};
    use crate::types::{HeartbeatsDoc, PeerState};
    use serde_json::json;
    use tokio::sync::watch;

    const HB: &str = "cmesh-heartbeat";

    fn setup() -> (Arc<MemoryStore>, PeerContext) {
        let store = Arc::new(MemoryStore::new());
        store.upsert(HB, "hb", json!({"beats": {}})).unwrap();
        let (tx, _rx) = watch::channel(PeerState::Init);
        let ctx = PeerContext::new("peer_a".into(), &PeerSettings::default(), tx);
        (store, ctx)
    }

    #[test]
    fn test_send_overwrites_single_entry() {
        let (store, ctx) = setup();
        let sender = HeartbeatSender::new(store.clone(), HB, "hb".into(), ctx.handle());
        assert!(sender.send().unwrap());
        ctx.transition(PeerState::Init, PeerState::Ready).unwrap();
        assert!(sender.send().unwrap());

        let doc: HeartbeatsDoc = decode(&store.find_by_id(HB, "hb").unwrap().unwrap()).unwrap();
        assert_eq!(doc.beats.len(), 1);
        let hb = &doc.beats["peer_a"];
        assert_eq!(hb.sender.state, "Ready");
        assert!(hb.sent_at_msec > 0);
    }

    #[test]
    fn test_suppressed_while_running() {
        let (store, ctx) = setup();
        let sender = HeartbeatSender::new(store.clone(), HB, "hb".into(), ctx.handle());
        ctx.transition(PeerState::Init, PeerState::Ready).unwrap();
        ctx.transition(PeerState::Ready, PeerState::Running).unwrap();
        let before = store.revision(HB, "hb");
        assert!(!sender.send().unwrap());
        assert_eq!(store.revision(HB, "hb"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_writing_after_running_and_cancel() {
        let (store, ctx) = setup();
        let sender = HeartbeatSender::new(store.clone(), HB, "hb".into(), ctx.handle());
        let timer = HeartbeatTimer::start(sender, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let written = store.revision(HB, "hb");
        // initial upsert + ticks at 0s, 1s, 2s
        assert_eq!(written, 4);

        ctx.transition(PeerState::Init, PeerState::Ready).unwrap();
        ctx.transition(PeerState::Ready, PeerState::Running).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.revision(HB, "hb"), written);

        timer.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.revision(HB, "hb"), written);
    }

    #[tokio::test]
    async fn test_locate_waits_for_coordinator() {
        let store = Arc::new(MemoryStore::new());
        let writer = store.clone();
        let locate = tokio::spawn(async move {
            locate_heartbeat_doc(store.as_ref(), HB, None).await
        });
        tokio::task::yield_now().await;
        writer.upsert(HB, "hb-doc", json!({"beats": {}})).unwrap();
        assert_eq!(locate.await.unwrap().unwrap(), "hb-doc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_locate_times_out() {
        let store = MemoryStore::new();
        let err = locate_heartbeat_doc(&store, HB, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Timeout(_)));
    }
}
