//! Peer side of a container-mesh load test.
//!
//! A [`peer::CmeshPeer`] registers with a coordinator through a replicated
//! document store, waits for the shared execution plan and start time, then
//! produces timestamped records into its own ring while consuming every other
//! peer's ring to measure message latency.

pub mod api;
pub mod config;
pub mod consumer;
pub mod context;
pub mod coordinator;
pub mod graph;
pub mod heartbeat;
pub mod peer;
pub mod producer;
pub mod stats;
pub mod store;
pub mod types;
