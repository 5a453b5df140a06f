use serde::{Deserialize, Serialize};

/// Running latency accumulator. All latencies are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub num_events: u64,
    pub min_msec: u64,
    pub max_msec: u64,
    pub avg_msec: u64,
    pub distinct_peers: usize,
    #[serde(default)]
    pub total_msec: u64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation. `avg_msec` stays equal to `total_msec / num_events`.
    pub fn record(&mut self, latency_msec: u64) {
        if self.num_events == 0 {
            self.min_msec = latency_msec;
            self.max_msec = latency_msec;
        } else {
            self.min_msec = self.min_msec.min(latency_msec);
            self.max_msec = self.max_msec.max(latency_msec);
        }
        self.num_events += 1;
        self.total_msec = self.total_msec.saturating_add(latency_msec);
        self.avg_msec = self.total_msec / self.num_events;
    }

    pub fn is_empty(&self) -> bool {
        self.num_events == 0
    }
}
