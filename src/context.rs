use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::config::{ConfigError, PeerSettings};
use crate::store::{DocumentId, StoreError};
use crate::types::{CoordinatorInfo, ExecutionPlan, PeerId, PeerState, SerializedPeer};

/// Everything that can abort a peer run. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("illegal state transition {expected} -> {to}: peer is in state {actual}")]
    IllegalStateTransition {
        expected: PeerState,
        actual: PeerState,
        to: PeerState,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("no {0} published by coordinator")]
    MissingCoordinatorInfo(&'static str),
    #[error("store observer closed while waiting for {0}")]
    ObserverClosed(&'static str),
    #[error("peer {0} was already started")]
    AlreadyStarted(PeerId),
    #[error("peer {0} has no report yet")]
    NoReport(PeerId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Read-only view of a peer's identity and live state, handed to tasks that
/// report on the peer (heartbeats, status API).
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: String,
    pub port: u16,
    state: watch::Receiver<PeerState>,
}

impl PeerHandle {
    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn to_serialized_peer(&self) -> SerializedPeer {
        SerializedPeer {
            peer_id: self.id.clone(),
            peer_ip_addr: self.addr.clone(),
            peer_port: self.port,
            state: self.state().to_string(),
        }
    }
}

/// Session state of one peer. The only writer of its lifecycle state.
pub struct PeerContext {
    pub id: PeerId,
    pub local_addr: String,
    pub local_port: u16,
    pub coord_addr: String,
    pub coord_port: u16,
    pub coord_collection: String,
    pub coord_doc_id: Option<DocumentId>,
    pub coord_info: Option<CoordinatorInfo>,
    state: watch::Sender<PeerState>,
}

impl PeerContext {
    pub fn new(id: PeerId, settings: &PeerSettings, state: watch::Sender<PeerState>) -> Self {
        state.send_replace(PeerState::Init);
        Self {
            id,
            local_addr: settings.bind_addr.clone(),
            local_port: settings.bind_port,
            coord_addr: settings.coord_addr.clone(),
            coord_port: settings.coord_port,
            coord_collection: settings.coord_collection.clone(),
            coord_doc_id: None,
            coord_info: None,
            state,
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            id: self.id.clone(),
            addr: self.local_addr.clone(),
            port: self.local_port,
            state: self.state.subscribe(),
        }
    }

    /// Move from `from` to its successor `to`. Anything else, including a correct
    /// pair attempted from the wrong current state, is fatal.
    pub fn transition(&self, from: PeerState, to: PeerState) -> Result<(), PeerError> {
        let legal = from.next() == Some(to);
        let mut actual = from;
        let changed = self.state.send_if_modified(|current| {
            actual = *current;
            if legal && *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(PeerError::IllegalStateTransition {
                expected: from,
                actual,
                to,
            });
        }
        info!(peer_id = %self.id, %from, %to, "state transition");
        Ok(())
    }

    pub fn to_serialized_peer(&self) -> SerializedPeer {
        self.handle().to_serialized_peer()
    }

    pub fn plan(&self) -> Result<&ExecutionPlan, PeerError> {
        self.coord_info
            .as_ref()
            .and_then(CoordinatorInfo::plan)
            .ok_or(PeerError::MissingCoordinatorInfo("execution plan"))
    }
}

/// Await `fut`, bounded by `limit` when one is configured.
pub async fn with_deadline<F: Future>(
    limit: Option<Duration>,
    what: &'static str,
    fut: F,
) -> Result<F::Output, PeerError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PeerError::Timeout(what)),
        None => Ok(fut.await),
    }
}
