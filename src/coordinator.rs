//! In-process coordinator for local mesh runs.
//!
//! Publishes the coordinator record and heartbeat document, gathers a quorum of
//! peers from their heartbeats, hands out the execution plan and finally the
//! shared start time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::context::{with_deadline, PeerError};
use crate::graph::PeerGraph;
use crate::store::{decode, encode, observe_until, DocumentStore, StoreError};
use crate::types::{
    system_time_msec, CoordinatorInfo, ExecutionPlan, HeartbeatsDoc, PeerDoc, PeerId, PeerState,
    SerializedPeer, HEARTBEAT_COLLECTION_NAME, PEER_COLLECTION_NAME,
};

const COORD_DOC_ID: &str = "coord-info";
const HEARTBEAT_DOC_ID: &str = "heartbeats";
const PEER_DOC_ID: &str = "peer-logs";

pub struct LocalCoordinator {
    store: Arc<dyn DocumentStore>,
    mesh: MeshConfig,
    coord_collection: String,
}

impl LocalCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, coord_collection: &str, mesh: MeshConfig) -> Self {
        Self {
            store,
            mesh,
            coord_collection: coord_collection.to_string(),
        }
    }

    /// Write the plan-less coordinator record and an empty heartbeat document.
    pub fn publish_info(&self) -> Result<(), StoreError> {
        let info = CoordinatorInfo {
            heartbeat_interval_sec: self.mesh.heartbeat_interval_sec,
            ..CoordinatorInfo::default()
        };
        self.store
            .upsert(&self.coord_collection, COORD_DOC_ID, encode(&info)?)?;
        self.store.upsert(
            HEARTBEAT_COLLECTION_NAME,
            HEARTBEAT_DOC_ID,
            encode(&HeartbeatsDoc::default())?,
        )?;
        info!(collection = %self.coord_collection, "published coordinator info");
        Ok(())
    }

    /// Wait until at least `mesh.peers` peers have sent a heartbeat in one of
    /// `states`. Returns every peer heard from so far.
    pub async fn wait_for_peers(
        &self,
        states: &[PeerState],
    ) -> Result<Vec<SerializedPeer>, PeerError> {
        let _sub = self.store.subscribe(HEARTBEAT_COLLECTION_NAME);
        let mut rx = self.store.observe(HEARTBEAT_COLLECTION_NAME);
        let need = self.mesh.peers;
        let peers = observe_until(&mut rx, |docs| {
            let Some(value) = docs.get(HEARTBEAT_DOC_ID) else {
                return Ok::<_, PeerError>(None);
            };
            let hbd: HeartbeatsDoc = decode(value)?;
            let k = hbd
                .beats
                .values()
                .filter(|hb| hb.sender.peer_state().is_some_and(|s| states.contains(&s)))
                .count();
            debug!(have = hbd.beats.len(), k, need, ?states, "heartbeat quorum");
            Ok((k >= need).then(|| hbd.beats.into_values().map(|hb| hb.sender).collect()))
        })
        .await?;
        peers.ok_or(PeerError::ObserverClosed("heartbeats"))
    }

    pub fn build_plan(&self, peers: &[SerializedPeer]) -> ExecutionPlan {
        let ids: Vec<PeerId> = peers.iter().map(|p| p.peer_id.clone()).collect();
        ExecutionPlan {
            start_time: None,
            test_duration_sec: self.mesh.test_duration_sec,
            peer_collection_name: PEER_COLLECTION_NAME.to_string(),
            peer_doc_id: PEER_DOC_ID.to_string(),
            min_msg_delay_msec: self.mesh.min_msg_delay_ms,
            max_msg_delay_msec: self.mesh.max_msg_delay_ms,
            peer_log_size: self.mesh.peer_log_size,
            peers: peers.to_vec(),
            connections: PeerGraph::build(self.mesh.graph, &ids, self.mesh.max_degree),
        }
    }

    pub fn publish_plan(&self, plan: &ExecutionPlan) -> Result<(), StoreError> {
        debug!(peers = plan.peers.len(), "publishing plan");
        self.store.update(
            &self.coord_collection,
            COORD_DOC_ID,
            &["execution_plan"],
            encode(plan)?,
        )
    }

    pub fn publish_start(&self, start_time: u64) -> Result<(), StoreError> {
        debug!(start_time, "publishing start time");
        self.store.update(
            &self.coord_collection,
            COORD_DOC_ID,
            &["execution_plan", "start_time"],
            encode(&start_time)?,
        )
    }

    /// Large meshes get extra time to see the start time before it passes.
    pub fn start_delay_sec(&self, peers: usize) -> u64 {
        let n = peers as u64;
        let mut seconds = self.mesh.start_delay_sec;
        if n > 40 {
            seconds += (n + 3) / 4;
        }
        seconds
    }

    /// Wait until every peer in the plan has at least one record in its ring.
    pub async fn wait_for_records(&self, plan: &ExecutionPlan) -> Result<(), PeerError> {
        let _sub = self.store.subscribe(&plan.peer_collection_name);
        let mut rx = self.store.observe(&plan.peer_collection_name);
        observe_until(&mut rx, |docs| {
            let Some(value) = docs.get(&plan.peer_doc_id) else {
                return Ok::<_, PeerError>(None);
            };
            let doc: PeerDoc = decode(value)?;
            let running = plan
                .peers
                .iter()
                .filter(|p| doc.logs.get(&p.peer_id).is_some_and(|l| !l.log.is_empty()))
                .count();
            Ok((running >= plan.peers.len()).then_some(()))
        })
        .await?
        .ok_or(PeerError::ObserverClosed("peer records"))
    }

    pub fn write_graph(&self, plan: &ExecutionPlan, dir: &Path) -> Result<PathBuf, PeerError> {
        let path = dir.join(format!(
            "conn-graph-{}-{}.dot",
            self.mesh.graph.name(),
            plan.peers.len()
        ));
        std::fs::write(&path, plan.connections.to_dot())?;
        info!(path = %path.display(), "wrote connection graph");
        Ok(path)
    }

    /// Drive one run: quorum, plan, readiness, start time, then wait for
    /// traffic and record the connection graph.
    pub async fn run(&self, output_dir: &Path) -> Result<ExecutionPlan, PeerError> {
        self.publish_info()?;

        info!(need = self.mesh.peers, "waiting for quorum");
        let peers = self.wait_for_peers(&[PeerState::Init, PeerState::Ready]).await?;
        let mut plan = self.build_plan(&peers);
        self.publish_plan(&plan)?;

        info!("waiting for peers to be ready");
        self.wait_for_peers(&[PeerState::Ready]).await?;
        let delay = self.start_delay_sec(plan.peers.len());
        let start_time = system_time_msec() + delay * 1000;
        info!(delay_sec = delay, "setting start time");
        self.publish_start(start_time)?;
        plan.start_time = Some(start_time);

        let limit = Duration::from_secs(delay + u64::from(self.mesh.test_duration_sec));
        match with_deadline(Some(limit), "peer records", self.wait_for_records(&plan)).await {
            Ok(res) => res?,
            Err(e) => warn!(error = %e, "not every peer produced records"),
        }
        self.write_graph(&plan, output_dir)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphType;
    use crate::store::MemoryStore;
    use crate::types::{Heartbeat, COORD_COLLECTION_NAME};

    fn mesh(peers: usize) -> MeshConfig {
        MeshConfig {
            peers,
            graph: GraphType::Complete,
            ..MeshConfig::default()
        }
    }

    fn beat(store: &MemoryStore, id: &str, state: PeerState) {
        let hb = Heartbeat {
            sender: SerializedPeer {
                peer_id: id.into(),
                peer_ip_addr: "10.0.0.1".into(),
                peer_port: 4010,
                state: state.to_string(),
            },
            sent_at_msec: system_time_msec(),
        };
        store
            .update(
                HEARTBEAT_COLLECTION_NAME,
                HEARTBEAT_DOC_ID,
                &["beats", id],
                encode(&hb).unwrap(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_quorum_counts_matching_states() {
        let store = Arc::new(MemoryStore::new());
        let coord = LocalCoordinator::new(store.clone(), COORD_COLLECTION_NAME, mesh(2));
        coord.publish_info().unwrap();
        beat(&store, "a", PeerState::Ready);
        beat(&store, "b", PeerState::Init);

        let all = coord
            .wait_for_peers(&[PeerState::Init, PeerState::Ready])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let writer = store.clone();
        let waiting = tokio::spawn(async move {
            let coord = LocalCoordinator::new(writer, COORD_COLLECTION_NAME, mesh(2));
            coord.wait_for_peers(&[PeerState::Ready]).await
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        beat(&store, "b", PeerState::Ready);
        assert_eq!(waiting.await.unwrap().unwrap().len(), 2);
        assert_eq!(store.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_plan_and_start_published_to_coord_record() {
        let store = Arc::new(MemoryStore::new());
        let coord = LocalCoordinator::new(store.clone(), COORD_COLLECTION_NAME, mesh(3));
        coord.publish_info().unwrap();
        let peers: Vec<SerializedPeer> = ["x", "y", "z"]
            .iter()
            .map(|id| SerializedPeer {
                peer_id: id.to_string(),
                peer_ip_addr: "10.0.0.2".into(),
                peer_port: 4010,
                state: "Init".into(),
            })
            .collect();
        let plan = coord.build_plan(&peers);
        assert_eq!(plan.connections.nmap.len(), 3);
        coord.publish_plan(&plan).unwrap();

        let read = |store: &MemoryStore| -> CoordinatorInfo {
            decode(&store.find_by_id(COORD_COLLECTION_NAME, COORD_DOC_ID).unwrap().unwrap()).unwrap()
        };
        let info = read(&store);
        assert!(info.has_plan());
        assert!(!info.has_start_time());

        coord.publish_start(1234).unwrap();
        let info = read(&store);
        assert_eq!(info.plan().unwrap().start_time(), Some(1234));
        assert_eq!(info.plan().unwrap().peers.len(), 3);
    }

    #[test]
    fn test_start_delay_grows_for_large_meshes() {
        let store = Arc::new(MemoryStore::new());
        let coord = LocalCoordinator::new(store, COORD_COLLECTION_NAME, mesh(2));
        assert_eq!(coord.start_delay_sec(2), 2);
        assert_eq!(coord.start_delay_sec(41), 2 + 11);
    }

    #[test]
    fn test_write_graph() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let coord = LocalCoordinator::new(store, COORD_COLLECTION_NAME, mesh(2));
        let peers: Vec<SerializedPeer> = ["a", "b"]
            .iter()
            .map(|id| SerializedPeer {
                peer_id: id.to_string(),
                peer_ip_addr: "10.0.0.2".into(),
                peer_port: 4010,
                state: "Ready".into(),
            })
            .collect();
        let path = coord.write_graph(&coord.build_plan(&peers), dir.path()).unwrap();
        assert!(path.ends_with("conn-graph-complete-2.dot"));
        let dot = std::fs::read_to_string(path).unwrap();
        assert!(dot.contains("\"b\" -> \"a\""));
    }
}
