use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::graph::PeerGraph;
use crate::stats::LatencyStats;

pub type PeerId = String;

pub const COORD_COLLECTION_NAME: &str = "cmesh-coord";
pub const HEARTBEAT_COLLECTION_NAME: &str = "cmesh-heartbeat";
pub const PEER_COLLECTION_NAME: &str = "cmesh-peers";
pub const DEFAULT_PEER_LOG_SIZE: usize = 16;
pub const DEFAULT_HEARTBEAT_INTERVAL_SEC: u32 = 2;
pub const REPORT_FILE_SUFFIX: &str = "-report.json";

/// Milliseconds since the UNIX epoch.
pub fn system_time_msec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `<name>_<random hex>`
pub fn random_peer_id(name: &str) -> PeerId {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}_{:x}", name, suffix)
}

/// Lifecycle of a peer. Strictly linear, see [`PeerState::next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerState {
    Init,      // Alive, reporting to coord.
    Ready,     // Have test plan, ready to execute
    Running,   // Executing
    Reporting, // Finished test, outputting results
    Shutdown,  // Done, exiting
}

impl PeerState {
    pub const ALL: [PeerState; 5] = [
        PeerState::Init,
        PeerState::Ready,
        PeerState::Running,
        PeerState::Reporting,
        PeerState::Shutdown,
    ];

    pub fn next(self) -> Option<PeerState> {
        match self {
            PeerState::Init => Some(PeerState::Ready),
            PeerState::Ready => Some(PeerState::Running),
            PeerState::Running => Some(PeerState::Reporting),
            PeerState::Reporting => Some(PeerState::Shutdown),
            PeerState::Shutdown => None,
        }
    }

    /// Heartbeats are a bootstrap-only signal.
    pub fn is_bootstrapping(self) -> bool {
        matches!(self, PeerState::Init | PeerState::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Init => "Init",
            PeerState::Ready => "Ready",
            PeerState::Running => "Running",
            PeerState::Reporting => "Reporting",
            PeerState::Shutdown => "Shutdown",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer identity as written into shared documents. The state is carried by name
/// so that readers built against a different enum layout still understand it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPeer {
    pub peer_id: PeerId,
    pub peer_ip_addr: String,
    pub peer_port: u16,
    pub state: String,
}

impl SerializedPeer {
    pub fn peer_state(&self) -> Option<PeerState> {
        serde_json::from_value(serde_json::Value::String(self.state.clone())).ok()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: SerializedPeer,
    pub sent_at_msec: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatsDoc {
    // latest heartbeat for each peer
    #[serde(default)]
    pub beats: std::collections::BTreeMap<PeerId, Heartbeat>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorInfo {
    pub heartbeat_collection_name: String,
    pub heartbeat_interval_sec: u32,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
}

impl Default for CoordinatorInfo {
    fn default() -> Self {
        Self {
            heartbeat_collection_name: HEARTBEAT_COLLECTION_NAME.to_string(),
            heartbeat_interval_sec: DEFAULT_HEARTBEAT_INTERVAL_SEC,
            execution_plan: None,
        }
    }
}

impl CoordinatorInfo {
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.execution_plan.as_ref()
    }

    pub fn has_plan(&self) -> bool {
        self.execution_plan.is_some()
    }

    pub fn has_start_time(&self) -> bool {
        self.plan().and_then(ExecutionPlan::start_time).is_some()
    }
}

fn default_peer_log_size() -> usize {
    DEFAULT_PEER_LOG_SIZE
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionPlan {
    // msec since epoch; absent (or zero) until the coordinator schedules the run
    #[serde(default)]
    pub start_time: Option<u64>,
    pub test_duration_sec: u32,
    pub peer_collection_name: String,
    pub peer_doc_id: String,
    pub min_msg_delay_msec: u32,
    pub max_msg_delay_msec: u32,
    #[serde(default = "default_peer_log_size")]
    pub peer_log_size: usize,
    #[serde(default)]
    pub peers: Vec<SerializedPeer>,
    #[serde(default)]
    pub connections: PeerGraph,
}

impl ExecutionPlan {
    pub fn start_time(&self) -> Option<u64> {
        self.start_time.filter(|t| *t > 0)
    }

    pub fn find_peer(&self, peer_id: &str) -> Option<&SerializedPeer> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub timestamp: u64,
    #[serde(default)]
    pub data: String,
}

/// One peer's ring buffer. Slots are keyed by their decimal index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerLog {
    #[serde(default)]
    pub log: std::collections::HashMap<String, PeerRecord>,
}

impl PeerLog {
    pub fn slot(&self, index: usize) -> Option<&PeerRecord> {
        self.log.get(&index.to_string())
    }
}

/// The shared document holding every peer's ring, partitioned by peer id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PeerDoc {
    #[serde(default)]
    pub logs: std::collections::BTreeMap<PeerId, PeerLog>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerReport {
    pub message_latency: LatencyStats,
    pub records_produced: u64,
}
