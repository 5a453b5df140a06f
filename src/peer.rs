//! Peer orchestration: bootstrap against the coordinator, wait for the shared
//! start time, run the producer/consumer pair for the planned duration, then
//! report and shut down.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PeerSettings;
use crate::consumer::Consumer;
use crate::context::{with_deadline, PeerContext, PeerError};
use crate::heartbeat::{locate_heartbeat_doc, HeartbeatSender, HeartbeatTimer};
use crate::producer::{Jitter, Producer};
use crate::store::{decode, observe_until, DocumentStore, Subscription, TransportConfig};
use crate::types::{
    random_peer_id, system_time_msec, CoordinatorInfo, ExecutionPlan, PeerId, PeerReport,
    PeerState, REPORT_FILE_SUFFIX,
};

/// Milestones delivered to the embedding application, always in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmeshEvent {
    BeginTest,
    EndTest,
    Exiting,
}

/// Resources held for the duration of one `start` call.
#[derive(Default)]
struct Session {
    heartbeat: Option<HeartbeatTimer>,
    coord_sub: Option<Subscription>,
    began: bool,
    exited: bool,
}

impl Session {
    fn cancel_heartbeat(&mut self) {
        if let Some(hb) = self.heartbeat.take() {
            hb.cancel();
        }
    }
}

pub struct CmeshPeer {
    settings: PeerSettings,
    store: Arc<dyn DocumentStore>,
    id: PeerId,
    state_tx: Option<watch::Sender<PeerState>>,
    state_rx: watch::Receiver<PeerState>,
    jitter_seed: Option<u64>,
    report: Option<PeerReport>,
}

impl CmeshPeer {
    pub fn new(settings: PeerSettings, store: Arc<dyn DocumentStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(PeerState::Init);
        Self {
            id: random_peer_id(&settings.device_name),
            settings,
            store,
            state_tx: Some(state_tx),
            state_rx,
            jitter_seed: None,
            report: None,
        }
    }

    /// Seed the producer's delay generator, for reproducible runs.
    pub fn with_jitter_seed(mut self, seed: Option<u64>) -> Self {
        self.jitter_seed = seed;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Live view of the lifecycle state.
    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    pub fn report(&self) -> Option<&PeerReport> {
        self.report.as_ref()
    }

    /// Run the whole peer lifecycle. `cb` sees `BeginTest`, `EndTest` and
    /// `Exiting` once each, in order, and is awaited before the run continues.
    /// If the run fails after `BeginTest`, `Exiting` is still delivered.
    pub async fn start<F, Fut>(&mut self, mut cb: F) -> Result<(), PeerError>
    where
        F: FnMut(CmeshEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let state_tx = self
            .state_tx
            .take()
            .ok_or_else(|| PeerError::AlreadyStarted(self.id.clone()))?;
        let mut session = Session::default();
        let result = self.drive(state_tx, &mut session, &mut cb).await;

        if let Err(e) = &result {
            warn!(peer_id = %self.id, error = %e, "peer run failed");
            if session.began && !session.exited {
                cb(CmeshEvent::Exiting).await;
            }
        }
        session.cancel_heartbeat();
        drop(session.coord_sub.take());
        self.store.stop_sync();
        info!(peer_id = %self.id, ok = result.is_ok(), "peer stopped");
        result
    }

    async fn drive<F, Fut>(
        &mut self,
        state_tx: watch::Sender<PeerState>,
        session: &mut Session,
        cb: &mut F,
    ) -> Result<(), PeerError>
    where
        F: FnMut(CmeshEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let output_dir = &self.settings.output_dir;
        if !output_dir.exists() {
            info!(dir = %output_dir.display(), "creating output directory");
        }
        tokio::fs::create_dir_all(output_dir).await?;

        let mut pctx = PeerContext::new(self.id.clone(), &self.settings, state_tx);
        self.bootstrap(&mut pctx, session).await?;

        info!(peer_id = %self.id, "running test plan");
        cb(CmeshEvent::BeginTest).await;
        session.began = true;

        let report = self.run_test(&mut pctx).await?;
        info!(
            peer_id = %self.id,
            produced = report.records_produced,
            consumed = report.message_latency.num_events,
            avg_msec = report.message_latency.avg_msec,
            "test finished"
        );
        self.report = Some(report);
        cb(CmeshEvent::EndTest).await;

        pctx.transition(PeerState::Reporting, PeerState::Shutdown)?;
        session.cancel_heartbeat();
        tokio::time::sleep(self.settings.report_propagation()).await;

        cb(CmeshEvent::Exiting).await;
        session.exited = true;
        Ok(())
    }

    async fn bootstrap(
        &self,
        pctx: &mut PeerContext,
        session: &mut Session,
    ) -> Result<(), PeerError> {
        self.init_transport(pctx);
        let identity = self.settings.identity()?;
        self.store.set_identity(&identity)?;
        self.store.start_sync()?;
        session.coord_sub = Some(self.store.subscribe(&pctx.coord_collection));

        self.wait_for_coord_info(pctx, false, false).await?;
        let info = pctx
            .coord_info
            .clone()
            .ok_or(PeerError::MissingCoordinatorInfo("coordinator info"))?;
        let hb_doc = locate_heartbeat_doc(
            self.store.as_ref(),
            &info.heartbeat_collection_name,
            self.settings.plan_wait_timeout(),
        )
        .await?;
        let sender = HeartbeatSender::new(
            self.store.clone(),
            &info.heartbeat_collection_name,
            hb_doc,
            pctx.handle(),
        );
        let period = Duration::from_secs(u64::from(info.heartbeat_interval_sec.max(1)));
        session.heartbeat = Some(HeartbeatTimer::start(sender, period));

        self.wait_for_coord_info(pctx, true, false).await?;
        pctx.transition(PeerState::Init, PeerState::Ready)?;
        self.wait_for_coord_info(pctx, true, true).await?;
        Ok(())
    }

    fn init_transport(&self, pctx: &PeerContext) {
        let config = TransportConfig {
            listen_addr: pctx.local_addr.clone(),
            listen_port: pctx.local_port,
            connect: BTreeSet::from([format!("{}:{}", pctx.coord_addr, pctx.coord_port)]),
        };
        info!(
            peer_id = %pctx.id,
            listen = %format!("{}:{}", config.listen_addr, config.listen_port),
            "set transport config"
        );
        self.store.set_transport_config(config);
    }

    /// Resolve once the coordinator record satisfies the request: any record at
    /// all, a plan, or a plan with a start time. The matching record is stored
    /// in `pctx`.
    pub async fn wait_for_coord_info(
        &self,
        pctx: &mut PeerContext,
        need_plan: bool,
        need_start: bool,
    ) -> Result<(), PeerError> {
        let mut rx = self.store.observe(&pctx.coord_collection);
        let found = with_deadline(
            self.settings.plan_wait_timeout(),
            "coordinator info",
            observe_until(&mut rx, |docs| {
                let Some((id, value)) = docs.iter().next() else {
                    return Ok::<_, PeerError>(None);
                };
                if docs.len() > 1 {
                    warn!(count = docs.len(), "multiple coordinator records, using first");
                }
                let info: CoordinatorInfo = match decode(value) {
                    Ok(info) => info,
                    Err(e) => {
                        debug!(error = %e, "incomplete coordinator record");
                        return Ok(None);
                    }
                };
                if (need_plan || need_start) && !info.has_plan() {
                    return Ok(None);
                }
                if need_start && !info.has_start_time() {
                    return Ok(None);
                }
                Ok(Some((id.clone(), info)))
            }),
        )
        .await??;
        let (id, info) = found.ok_or(PeerError::ObserverClosed("coordinator info"))?;
        debug!(
            peer_id = %pctx.id,
            doc_id = %id,
            plan = info.has_plan(),
            start = info.has_start_time(),
            "coordinator info"
        );
        pctx.coord_doc_id = Some(id);
        pctx.coord_info = Some(info);
        Ok(())
    }

    /// Dial the peers the connection graph assigns to us, in addition to the
    /// coordinator.
    fn connect_mesh(&self, pctx: &PeerContext, plan: &ExecutionPlan) {
        let mut config = self.store.transport_config().unwrap_or_default();
        if !plan.connections.nmap.contains_key(&pctx.id) {
            warn!(peer_id = %pctx.id, "not in connection graph");
        }
        for target in plan.connections.outgoing(&pctx.id) {
            match plan.find_peer(target) {
                Some(p) => {
                    config
                        .connect
                        .insert(format!("{}:{}", p.peer_ip_addr, p.peer_port));
                }
                None => warn!(peer_id = %pctx.id, target = %target, "connection target not in roster"),
            }
        }
        info!(peer_id = %pctx.id, connect = config.connect.len(), "connecting mesh");
        self.store.set_transport_config(config);
    }

    async fn run_test(&self, pctx: &mut PeerContext) -> Result<PeerReport, PeerError> {
        let plan = pctx.plan()?.clone();
        self.connect_mesh(pctx, &plan);

        let start_time = plan
            .start_time()
            .ok_or(PeerError::MissingCoordinatorInfo("start time"))?;
        let now = system_time_msec();
        if start_time > now {
            info!(peer_id = %pctx.id, wait_ms = start_time - now, "waiting for start time");
            tokio::time::sleep(Duration::from_millis(start_time - now)).await;
        }
        pctx.transition(PeerState::Ready, PeerState::Running)?;

        let mut consumer = Consumer::new(self.store.clone(), &pctx.id, &plan);
        consumer.start()?;
        let mut producer = Producer::new(self.store.clone(), &pctx.id, &plan);
        producer.start(Jitter::from_plan(&plan, self.jitter_seed));

        info!(peer_id = %pctx.id, duration_sec = plan.test_duration_sec, "test running");
        tokio::time::sleep(Duration::from_secs(u64::from(plan.test_duration_sec))).await;

        let records_produced = producer.stop();
        let message_latency = consumer.stop();
        pctx.transition(PeerState::Running, PeerState::Reporting)?;
        Ok(PeerReport {
            message_latency,
            records_produced,
        })
    }

    /// Write the report as JSON to `<dir>/<peer_id>-report.json`.
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf, PeerError> {
        let report = self
            .report
            .as_ref()
            .ok_or_else(|| PeerError::NoReport(self.id.clone()))?;
        let path = dir.join(format!("{}{}", self.id, REPORT_FILE_SUFFIX));
        std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
        info!(peer_id = %self.id, path = %path.display(), "wrote report");
        Ok(path)
    }
}
