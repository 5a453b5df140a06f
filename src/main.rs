use anyhow::Context;
use cmesh_peer::api::{self, MeshStatus, PeerStatus, SharedState};
use cmesh_peer::config::Config;
use cmesh_peer::context::PeerError;
use cmesh_peer::coordinator::LocalCoordinator;
use cmesh_peer::peer::{CmeshEvent, CmeshPeer};
use cmesh_peer::store::MemoryStore;
use cmesh_peer::types::PeerState;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use clap::{Parser, Subcommand};

/// cmesh-peer: synchronized load-test peers over a replicated document store
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a local mesh: one coordinator and the configured number of peers
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Show current mesh state
    Show {
        /// API URL (default: http://127.0.0.1:3000)
        #[arg(long, default_value = "http://127.0.0.1:3000")]
        api: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        config: "config.toml".to_string(),
    }) {
        Commands::Run { config } => run_mesh(&config).await,
        Commands::Validate { config } => validate_config(&config),
        Commands::Show { api } => show_state(&api).await,
    }
}

fn validate_config(path: &str) -> anyhow::Result<()> {
    match Config::load(path) {
        Ok(cfg) => {
            info!(path, "configuration is valid");
            info!(
                peers = cfg.mesh.peers,
                duration_sec = cfg.mesh.test_duration_sec,
                graph = cfg.mesh.graph.name(),
                "mesh"
            );
            if let Err(e) = cfg.peer.identity() {
                warn!(error = %e, "credentials not resolved");
            }
            Ok(())
        }
        Err(e) => {
            error!(path, error = %e, "configuration is INVALID");
            Err(anyhow::anyhow!("Invalid config"))
        }
    }
}

async fn run_mesh(config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading config {}", config_path))?;
    let output_dir = config.peer.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output dir {}", output_dir.display()))?;

    info!(
        peers = config.mesh.peers,
        duration_sec = config.mesh.test_duration_sec,
        "starting local mesh"
    );

    let state: SharedState = Arc::new(Mutex::new(MeshStatus::default()));
    let started = std::time::Instant::now();
    tokio::spawn(api::serve(config.api.listen, state.clone()));

    let space = MemoryStore::new();
    let coordinator = LocalCoordinator::new(
        Arc::new(space.replica()),
        &config.peer.coord_collection,
        config.mesh.clone(),
    );

    let mut watches: Vec<(String, watch::Receiver<PeerState>)> = Vec::new();
    let mut peers = JoinSet::new();
    for i in 0..config.mesh.peers {
        let mut settings = config.peer.clone();
        settings.device_name = format!("{}{}", config.peer.device_name, i);
        settings.bind_port = config.peer.bind_port.saturating_add(i as u16);
        let seed = config.mesh.seed.map(|s| s.wrapping_add(i as u64));
        let mut peer = CmeshPeer::new(settings, Arc::new(space.replica())).with_jitter_seed(seed);

        let id = peer.id().to_string();
        watches.push((id.clone(), peer.state_watch()));
        state.lock().await.peers.push(PeerStatus {
            peer_id: id.clone(),
            state: PeerState::Init,
            last_event: None,
            report: None,
        });

        let events = state.clone();
        peers.spawn(async move {
            let res = peer
                .start(|ev: CmeshEvent| {
                    let events = events.clone();
                    let id = id.clone();
                    async move {
                        info!(peer_id = %id, event = ?ev, "peer event");
                        if let Some(p) = events.lock().await.peer_mut(&id) {
                            p.last_event = Some(format!("{:?}", ev));
                        }
                    }
                })
                .await;
            (peer, res)
        });
    }

    // Stats Updater
    let stats_state = state.clone();
    let updater = tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_millis(1000)).await;
            let mut s = stats_state.lock().await;
            s.uptime_secs = started.elapsed().as_secs();
            for (id, rx) in &watches {
                let current = *rx.borrow();
                if let Some(p) = s.peer_mut(id) {
                    p.state = current;
                }
            }
        }
    });

    let coord_dir = output_dir.clone();
    let coord = tokio::spawn(async move { coordinator.run(&coord_dir).await });

    let mut failed = 0;
    let mut interrupted = false;
    loop {
        tokio::select! {
            joined = peers.join_next() => {
                let Some(joined) = joined else { break };
                let (peer, res) = joined.context("peer task panicked")?;
                if !finish_peer(&state, &output_dir, &peer, res).await {
                    failed += 1;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                peers.abort_all();
                interrupted = true;
                break;
            }
        }
    }
    updater.abort();
    if interrupted || failed > 0 {
        coord.abort();
    }

    match coord.await {
        Ok(Ok(plan)) => info!(peers = plan.peers.len(), "coordinator finished"),
        Ok(Err(e)) => error!(error = %e, "coordinator failed"),
        Err(e) if e.is_cancelled() => warn!("coordinator cancelled"),
        Err(e) => error!(error = %e, "coordinator task failed"),
    }

    let s = state.lock().await;
    println!("{}", serde_json::to_string_pretty(&*s)?);
    if failed > 0 {
        return Err(anyhow::anyhow!("{} peer(s) failed", failed));
    }
    Ok(())
}

/// Record a joined peer's outcome. Never fails, so one bad peer cannot cut the
/// others short. Returns whether the peer ran and its report was written.
async fn finish_peer(
    state: &SharedState,
    output_dir: &Path,
    peer: &CmeshPeer,
    res: Result<(), PeerError>,
) -> bool {
    if let Err(e) = res {
        error!(peer_id = %peer.id(), error = %e, "peer failed");
        return false;
    }
    match peer.write_report(output_dir) {
        Ok(path) => {
            let mut s = state.lock().await;
            if let Some(p) = s.peer_mut(peer.id()) {
                p.state = PeerState::Shutdown;
                p.report = peer.report().cloned();
            }
            info!(peer_id = %peer.id(), path = %path.display(), "peer finished");
            true
        }
        Err(e) => {
            error!(peer_id = %peer.id(), error = %e, "failed to write report");
            false
        }
    }
}

async fn show_state(api_url: &str) -> anyhow::Result<()> {
    match reqwest::get(format!("{}/state", api_url)).await {
        Ok(resp) => {
            let state = resp.json::<MeshStatus>().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Err(e) => eprintln!("Failed to connect to API: {}", e),
    }
    Ok(())
}
