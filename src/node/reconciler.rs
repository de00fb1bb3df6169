//! Reconciles process liveness and control-API health into `NodeState`.
//!
//! Single owner of the lifecycle stage. Every transition goes through
//! [`Reconciler::apply`], which enforces the legality table and emits exactly
//! one snapshot per transition; poll samples refresh repo size and peer info
//! without transitioning.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::events::EventBroadcaster;

use super::process::{LaunchError, NodePorts, NodeProcess, TerminateError, TerminateOutcome};
use super::state::{NodeStage, NodeState, PeerInfo};
use super::{ApiError, NodeApi, NodeStatus};

/// Consecutive failed poll samples tolerated before downgrading to Failed.
const MAX_FAILED_SAMPLES: u32 = 3;
/// Status probe cadence inside the startup window.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("node failed to come online within {0:?}")]
    StartupTimeout(Duration),
    #[error("node process exited during startup")]
    ExitedDuringStartup,
    #[error(transparent)]
    Terminate(#[from] TerminateError),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub startup_timeout: Duration,
    pub terminate_timeout: Duration,
    pub poll_interval: Duration,
    /// Ports reported before the process has scouted real ones.
    pub default_ports: NodePorts,
}

struct Inner {
    stage: NodeStage,
    repo_size_bytes: Option<u64>,
    peer_info: Option<PeerInfo>,
    error: Option<String>,
    failed_samples: u32,
}

pub struct Reconciler {
    api: Arc<dyn NodeApi>,
    /// `None` means the node is externally managed: supervise over the API
    /// only, never spawn or signal a process.
    process: Option<Arc<NodeProcess>>,
    broadcaster: Arc<EventBroadcaster>,
    config: ReconcilerConfig,
    inner: Mutex<Inner>,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn NodeApi>,
        process: Option<Arc<NodeProcess>>,
        broadcaster: Arc<EventBroadcaster>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            process,
            broadcaster,
            config,
            inner: Mutex::new(Inner {
                stage: NodeStage::Unknown,
                repo_size_bytes: None,
                peer_info: None,
                error: None,
                failed_samples: 0,
            }),
        })
    }

    pub async fn stage(&self) -> NodeStage {
        self.inner.lock().await.stage
    }

    pub async fn snapshot(&self) -> NodeState {
        let inner = self.inner.lock().await;
        self.snapshot_locked(&inner)
    }

    /// Launch the node and wait for it to come online.
    ///
    /// Fails with [`NodeError::AlreadyRunning`] — leaving the state untouched —
    /// if a launch, shutdown or online node is already in place.
    pub async fn launch(&self) -> Result<NodeState, NodeError> {
        {
            let mut inner = self.inner.lock().await;
            match inner.stage {
                NodeStage::Online | NodeStage::Starting | NodeStage::Stopping => {
                    return Err(NodeError::AlreadyRunning)
                }
                NodeStage::Unknown | NodeStage::Offline | NodeStage::Failed => {}
            }
            self.apply(&mut inner, NodeStage::Starting, None);
        }

        if let Some(process) = &self.process {
            if let Err(e) = process.launch().await {
                let mut inner = self.inner.lock().await;
                self.apply(&mut inner, NodeStage::Failed, Some(e.to_string()));
                return Err(e.into());
            }
        }

        // Probe until the control API answers or the startup window closes.
        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            match self.api.status().await {
                Ok(status) => {
                    let repo_size = self.api.repo_stat().await.ok().map(|s| s.repo_size_bytes);
                    let mut inner = self.inner.lock().await;
                    inner.peer_info = Some(peer_info(status));
                    if repo_size.is_some() {
                        inner.repo_size_bytes = repo_size;
                    }
                    self.apply(&mut inner, NodeStage::Online, None);
                    info!("node is online");
                    return Ok(self.snapshot_locked(&inner));
                }
                Err(probe_err) => {
                    if let Some(process) = &self.process {
                        if !process.is_alive().await {
                            let mut inner = self.inner.lock().await;
                            self.apply(
                                &mut inner,
                                NodeStage::Failed,
                                Some("node process exited during startup".to_string()),
                            );
                            return Err(NodeError::ExitedDuringStartup);
                        }
                    }
                    if Instant::now() >= deadline {
                        let mut inner = self.inner.lock().await;
                        self.apply(
                            &mut inner,
                            NodeStage::Failed,
                            Some(format!("startup window expired: {probe_err}")),
                        );
                        return Err(NodeError::StartupTimeout(self.config.startup_timeout));
                    }
                    tokio::time::sleep(PROBE_INTERVAL).await;
                }
            }
        }
    }

    /// Stop the node. A node that is not online is left alone — shutdown is
    /// idempotent from the caller's perspective.
    pub async fn shutdown(&self) -> Result<NodeState, NodeError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.stage != NodeStage::Online {
                return Ok(self.snapshot_locked(&inner));
            }
            self.apply(&mut inner, NodeStage::Stopping, None);
        }

        // Graceful stop via the control API; the process signal path is the
        // escalation fallback.
        let _ = self.api.shutdown().await;
        if let Some(process) = &self.process {
            match process.terminate(self.config.terminate_timeout).await {
                Ok(TerminateOutcome::Graceful) => {}
                Ok(TerminateOutcome::ForcedKill) => {
                    warn!("node ignored graceful stop and was killed");
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    self.apply(&mut inner, NodeStage::Offline, Some(e.to_string()));
                    return Err(e.into());
                }
            }
        }

        let mut inner = self.inner.lock().await;
        self.apply(&mut inner, NodeStage::Offline, None);
        info!("node is offline");
        Ok(self.snapshot_locked(&inner))
    }

    /// Background sampling loop. One per daemon.
    pub fn spawn_poll_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.poll_once().await;
            }
        })
    }

    /// Sample repo size and peer info once. A transient failure records the
    /// error without transitioning; [`MAX_FAILED_SAMPLES`] consecutive
    /// failures (or a dead process) downgrade to Failed.
    pub async fn poll_once(&self) {
        if self.stage().await != NodeStage::Online {
            return;
        }

        if let Some(process) = &self.process {
            if !process.is_alive().await {
                let mut inner = self.inner.lock().await;
                if inner.stage == NodeStage::Online {
                    self.apply(
                        &mut inner,
                        NodeStage::Failed,
                        Some("node process exited unexpectedly".to_string()),
                    );
                }
                return;
            }
        }

        let sample = async {
            let status = self.api.status().await?;
            let stat = self.api.repo_stat().await?;
            Ok::<_, ApiError>((status, stat))
        }
        .await;

        let mut inner = self.inner.lock().await;
        if inner.stage != NodeStage::Online {
            // A shutdown raced the sample; its result is stale.
            return;
        }
        match sample {
            Ok((status, stat)) => {
                inner.failed_samples = 0;
                inner.error = None;
                inner.peer_info = Some(peer_info(status));
                inner.repo_size_bytes = Some(stat.repo_size_bytes);
                self.emit(&inner);
            }
            Err(e) => {
                inner.failed_samples += 1;
                if inner.failed_samples >= MAX_FAILED_SAMPLES {
                    let failed = inner.failed_samples;
                    self.apply(
                        &mut inner,
                        NodeStage::Failed,
                        Some(format!("node stopped answering ({failed} failed samples): {e}")),
                    );
                } else {
                    inner.error = Some(format!("status sample failed: {e}"));
                    self.emit(&inner);
                }
            }
        }
    }

    /// Apply a transition if legal and emit the resulting snapshot.
    fn apply(&self, inner: &mut Inner, next: NodeStage, error: Option<String>) {
        if !inner.stage.can_transition(next) {
            warn!(from = ?inner.stage, to = ?next, "refusing illegal stage transition");
            return;
        }
        inner.stage = next;
        inner.failed_samples = 0;
        inner.error = error;
        if !next.is_online() {
            inner.peer_info = None;
        }
        self.emit(inner);
    }

    fn emit(&self, inner: &Inner) {
        self.broadcaster.node_state_changed(self.snapshot_locked(inner));
    }

    fn snapshot_locked(&self, inner: &Inner) -> NodeState {
        let ports = self
            .process
            .as_ref()
            .and_then(|p| p.ports())
            .unwrap_or(self.config.default_ports);
        NodeState {
            stage: inner.stage,
            online: inner.stage.is_online(),
            operating: inner.stage.is_operating(),
            api_port: ports.api,
            gateway_port: ports.gateway,
            swarm_port: ports.swarm,
            repo_size_bytes: inner.repo_size_bytes,
            peer_info: inner.peer_info.clone(),
            error: inner.error.clone(),
        }
    }
}

fn peer_info(status: NodeStatus) -> PeerInfo {
    let host_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    PeerInfo {
        host_name,
        node_version: status.node_version,
        peer_id: status.peer_id,
        peer_count: status.peer_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory::MemoryNode;

    fn test_setup() -> (Arc<MemoryNode>, Arc<EventBroadcaster>, Arc<Reconciler>) {
        let node = Arc::new(MemoryNode::new());
        let bus = Arc::new(EventBroadcaster::new(NodeState::unknown(5981, 18181, 4001)));
        let reconciler = Reconciler::new(
            node.clone(),
            None,
            bus.clone(),
            ReconcilerConfig {
                startup_timeout: Duration::from_millis(500),
                terminate_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_secs(30),
                default_ports: NodePorts { api: 5981, gateway: 18181, swarm: 4001 },
            },
        );
        (node, bus, reconciler)
    }

    #[tokio::test]
    async fn launch_reaches_online_with_peer_info() {
        let (_node, _bus, reconciler) = test_setup();
        let state = reconciler.launch().await.unwrap();
        assert_eq!(state.stage, NodeStage::Online);
        assert!(state.online);
        assert!(!state.operating);
        assert!(state.peer_info.is_some());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn launch_while_online_fails_without_touching_state() {
        let (_node, _bus, reconciler) = test_setup();
        let before = reconciler.launch().await.unwrap();
        let err = reconciler.launch().await.unwrap_err();
        assert!(matches!(err, NodeError::AlreadyRunning));
        assert_eq!(reconciler.snapshot().await, before);
    }

    #[tokio::test]
    async fn shutdown_walks_stopping_to_offline_and_allows_relaunch() {
        let (node, _bus, reconciler) = test_setup();
        reconciler.launch().await.unwrap();
        let state = reconciler.shutdown().await.unwrap();
        assert_eq!(state.stage, NodeStage::Offline);
        assert!(state.peer_info.is_none());

        node.set_offline(false);
        let state = reconciler.launch().await.unwrap();
        assert_eq!(state.stage, NodeStage::Online);
    }

    #[tokio::test]
    async fn launch_against_a_dead_node_fails_within_the_window() {
        let (node, _bus, reconciler) = test_setup();
        node.set_offline(true);
        let err = reconciler.launch().await.unwrap_err();
        assert!(matches!(err, NodeError::StartupTimeout(_)));
        let state = reconciler.snapshot().await;
        assert_eq!(state.stage, NodeStage::Failed);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn single_failed_sample_keeps_online_and_records_error() {
        let (node, _bus, reconciler) = test_setup();
        reconciler.launch().await.unwrap();
        node.set_offline(true);
        reconciler.poll_once().await;
        let state = reconciler.snapshot().await;
        assert_eq!(state.stage, NodeStage::Online);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn three_failed_samples_downgrade_to_failed() {
        let (node, _bus, reconciler) = test_setup();
        reconciler.launch().await.unwrap();
        node.set_offline(true);
        for _ in 0..3 {
            reconciler.poll_once().await;
        }
        let state = reconciler.snapshot().await;
        assert_eq!(state.stage, NodeStage::Failed);
        assert!(state.peer_info.is_none());
    }

    #[tokio::test]
    async fn successful_sample_clears_a_recorded_error() {
        let (node, _bus, reconciler) = test_setup();
        reconciler.launch().await.unwrap();
        node.set_offline(true);
        reconciler.poll_once().await;
        node.set_offline(false);
        reconciler.poll_once().await;
        let state = reconciler.snapshot().await;
        assert_eq!(state.stage, NodeStage::Online);
        assert!(state.error.is_none());
        assert!(state.repo_size_bytes.is_some());
    }

    #[tokio::test]
    async fn every_observed_transition_is_a_legal_edge() {
        let (node, bus, reconciler) = test_setup();
        let (initial, mut rx) = bus.subscribe();

        reconciler.launch().await.unwrap();
        reconciler.shutdown().await.unwrap();
        node.set_offline(false);
        reconciler.launch().await.unwrap();
        node.set_offline(true);
        for _ in 0..3 {
            reconciler.poll_once().await;
        }

        let mut previous = initial.stage;
        while let Ok(event) = rx.try_recv() {
            if let crate::events::Event::NodeStateChanged(state) = event {
                if state.stage != previous {
                    assert!(
                        previous.can_transition(state.stage),
                        "illegal transition {previous:?} -> {:?}",
                        state.stage
                    );
                    previous = state.stage;
                }
            }
        }
        assert_eq!(previous, NodeStage::Failed);
    }
}
