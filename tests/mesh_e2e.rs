use cmesh_peer::config::{MeshConfig, PeerSettings};
use cmesh_peer::coordinator::LocalCoordinator;
use cmesh_peer::graph::GraphType;
use cmesh_peer::peer::{CmeshEvent, CmeshPeer};
use cmesh_peer::store::MemoryStore;
use cmesh_peer::types::{PeerState, COORD_COLLECTION_NAME};
use std::sync::{Arc, Mutex};

const LOG_SIZE: usize = 4;

fn peer_settings(name: &str, port: u16, dir: &std::path::Path) -> PeerSettings {
    PeerSettings {
        device_name: name.to_string(),
        bind_port: port,
        output_dir: dir.to_path_buf(),
        report_propagation_ms: 50,
        license: Some("test-license".into()),
        app_id: Some("test-app".into()),
        ..PeerSettings::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peer_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let space = MemoryStore::new();

    let mesh = MeshConfig {
        peers: 2,
        test_duration_sec: 1,
        min_msg_delay_ms: 10,
        max_msg_delay_ms: 10,
        peer_log_size: LOG_SIZE,
        heartbeat_interval_sec: 1,
        start_delay_sec: 1,
        graph: GraphType::Complete,
        ..MeshConfig::default()
    };
    let coordinator = LocalCoordinator::new(Arc::new(space.replica()), COORD_COLLECTION_NAME, mesh);
    let coord_dir = dir.path().to_path_buf();
    let coord = tokio::spawn(async move { coordinator.run(&coord_dir).await });

    let mut runs = Vec::new();
    for i in 0..2u16 {
        let store = Arc::new(space.replica());
        let mut peer = CmeshPeer::new(peer_settings("e2e", 4010 + i, dir.path()), store.clone())
            .with_jitter_seed(Some(u64::from(i)));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        runs.push(tokio::spawn(async move {
            let res = peer
                .start(move |ev| {
                    sink.lock().unwrap().push(ev);
                    std::future::ready(())
                })
                .await;
            (peer, store, events, res)
        }));
    }

    // (peer id, records produced, records consumed)
    let mut counts = Vec::new();
    for run in runs {
        let (peer, store, events, res) = run.await.unwrap();
        res.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![CmeshEvent::BeginTest, CmeshEvent::EndTest, CmeshEvent::Exiting]
        );
        assert_eq!(*peer.state_watch().borrow(), PeerState::Shutdown);
        assert!(!store.is_syncing());

        let report = peer.report().unwrap();
        let lat = &report.message_latency;
        assert!(report.records_produced > 0);
        assert!(lat.num_events > 0);
        assert!(lat.min_msec <= lat.avg_msec && lat.avg_msec <= lat.max_msec);
        assert_eq!(lat.distinct_peers, 1);

        let path = peer.write_report(dir.path()).unwrap();
        assert!(path.exists());
        counts.push((peer.id().to_string(), report.records_produced, lat.num_events));
    }

    // each record of the other peer is consumed at most once, and only the
    // last ring's worth may still be in flight when the consumer stops
    for (i, (_, _, consumed)) in counts.iter().enumerate() {
        let (_, other_produced, _) = &counts[1 - i];
        assert!(*consumed <= *other_produced);
        assert!(*consumed >= other_produced.saturating_sub(LOG_SIZE as u64));
    }

    let plan = coord.await.unwrap().unwrap();
    assert_eq!(plan.peers.len(), 2);
    for (id, _, _) in &counts {
        assert!(plan.find_peer(id).is_some());
        assert_eq!(plan.connections.undirected_links(id).unwrap().len(), 1);
    }
    assert!(dir.path().join("conn-graph-complete-2.dot").exists());
}
