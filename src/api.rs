use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::types::{PeerId, PeerReport, PeerState};

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct MeshStatus {
    pub uptime_secs: u64,
    pub peers: Vec<PeerStatus>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub state: PeerState,
    pub last_event: Option<String>,
    pub report: Option<PeerReport>,
}

impl MeshStatus {
    pub fn peer_mut(&mut self, peer_id: &str) -> Option<&mut PeerStatus> {
        self.peers.iter_mut().find(|p| p.peer_id == peer_id)
    }
}

/// Status shared between the API handler and the mesh runner.
pub type SharedState = Arc<Mutex<MeshStatus>>;

pub fn router(state: SharedState) -> axum::Router {
    axum::Router::new()
        .route("/state", axum::routing::get(get_state))
        .with_state(state)
}

/// Serve the status API until the listener fails.
pub async fn serve(listen: SocketAddr, state: SharedState) {
    match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => {
            info!(%listen, "status API listening");
            if let Err(e) = axum::serve(listener, router(state)).await {
                error!(error = %e, "status API error");
            }
        }
        Err(e) => error!(%listen, error = %e, "failed to bind status API"),
    }
}

pub async fn get_state(
    axum::extract::State(state): axum::extract::State<SharedState>,
) -> axum::Json<MeshStatus> {
    let s = state.lock().await;
    axum::Json(s.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::LatencyStats;

    #[tokio::test]
    async fn test_get_state_returns_snapshot() {
        let state: SharedState = Arc::new(Mutex::new(MeshStatus::default()));
        state.lock().await.peers.push(PeerStatus {
            peer_id: "p_1".into(),
            state: PeerState::Running,
            last_event: Some("BeginTest".into()),
            report: None,
        });

        let axum::Json(snap) = get_state(axum::extract::State(state.clone())).await;
        assert_eq!(snap.peers.len(), 1);
        assert_eq!(snap.peers[0].state, PeerState::Running);

        {
            let mut s = state.lock().await;
            let p = s.peer_mut("p_1").unwrap();
            p.state = PeerState::Shutdown;
            p.report = Some(PeerReport {
                message_latency: LatencyStats::default(),
                records_produced: 9,
            });
        }
        let axum::Json(snap) = get_state(axum::extract::State(state)).await;
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["peers"][0]["state"], "Shutdown");
        assert_eq!(json["peers"][0]["report"]["records_produced"], 9);
    }
}
