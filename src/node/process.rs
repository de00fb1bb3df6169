//! Child-process handle for the external node.
//!
//! Owns spawn, liveness and termination of exactly one node process. The
//! graceful stop path is driven by the reconciler (control-API shutdown
//! first); this handle only knows how to signal, wait and escalate.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::net;

/// The node's three listen ports, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePorts {
    pub api: u16,
    pub gateway: u16,
    pub swarm: u16,
}

/// Ports are scouted at first launch and shared with the HTTP API client.
pub type SharedPorts = Arc<RwLock<Option<NodePorts>>>;

#[derive(Debug, Clone)]
pub struct NodeProcessConfig {
    /// Node binary (e.g. `ipfs` / `kubo`).
    pub bin: PathBuf,
    /// Node repository directory, passed via `IPFS_PATH`.
    pub repo_dir: PathBuf,
    /// Arguments for the long-running daemon invocation.
    pub daemon_args: Vec<String>,
    pub api_port_range: (u16, u16),
    pub gateway_port_range: (u16, u16),
    pub swarm_port_range: (u16, u16),
    /// Initialize and configure the repo before the first launch.
    pub provision: bool,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("node process is already running")]
    AlreadyRunning,
    #[error("no free {0} port in the configured range")]
    NoFreePort(&'static str),
    #[error("failed to provision node repo: {0}")]
    Provision(String),
    #[error("failed to spawn node process: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to wait for node process: {0}")]
    Wait(#[from] std::io::Error),
}

/// How the process went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Exited within the grace window.
    Graceful,
    /// Ignored the stop signal and had to be killed. Non-fatal, logged.
    ForcedKill,
}

pub struct NodeProcess {
    config: NodeProcessConfig,
    ports: SharedPorts,
    child: Mutex<Option<Child>>,
}

impl NodeProcess {
    pub fn new(config: NodeProcessConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            ports: Arc::new(RwLock::new(None)),
            child: Mutex::new(None),
        })
    }

    /// Handle shared with the HTTP API client so it always dials the port the
    /// running process was actually given.
    pub fn ports_handle(&self) -> SharedPorts {
        Arc::clone(&self.ports)
    }

    pub fn ports(&self) -> Option<NodePorts> {
        *self.ports.read().expect("ports lock poisoned")
    }

    /// Spawn the node daemon process.
    ///
    /// Fails with [`LaunchError::AlreadyRunning`] if a previous child is still
    /// alive; an exited child is reaped and replaced.
    pub async fn launch(&self) -> Result<NodePorts, LaunchError> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(LaunchError::AlreadyRunning);
            }
            *slot = None;
        }

        let ports = self.ensure_ports()?;
        if self.config.provision {
            self.provision(ports).await?;
        }

        let mut cmd = Command::new(&self.config.bin);
        cmd.args(&self.config.daemon_args)
            .env("IPFS_PATH", &self.config.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        // Drain both pipes into tracing so the node can never block on a full
        // pipe buffer.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, "node stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, "node stderr"));
        }

        info!(?pid, api_port = ports.api, swarm_port = ports.swarm, "node process launched");
        *slot = Some(child);
        Ok(ports)
    }

    /// Whether the child process is currently running.
    pub async fn is_alive(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the child: signal, wait up to `timeout`, then kill.
    ///
    /// Returns [`TerminateOutcome::ForcedKill`] when escalation was needed —
    /// callers treat that as success with a warning, not a failure.
    pub async fn terminate(&self, timeout: Duration) -> Result<TerminateOutcome, TerminateError> {
        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return Ok(TerminateOutcome::Graceful);
        };
        if child.try_wait()?.is_some() {
            return Ok(TerminateOutcome::Graceful);
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: signalling our own child by pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            debug!(pid, "sent SIGTERM to node process");
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(?status, "node process exited");
                Ok(TerminateOutcome::Graceful)
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "node ignored stop signal — killing");
                child.kill().await?;
                Ok(TerminateOutcome::ForcedKill)
            }
        }
    }

    /// Scout and freeze the three listen ports. Once assigned they never
    /// change for this handle, even across relaunches.
    fn ensure_ports(&self) -> Result<NodePorts, LaunchError> {
        let mut guard = self.ports.write().expect("ports lock poisoned");
        if let Some(ports) = *guard {
            return Ok(ports);
        }
        let (api_lo, api_hi) = self.config.api_port_range;
        let (gw_lo, gw_hi) = self.config.gateway_port_range;
        let (sw_lo, sw_hi) = self.config.swarm_port_range;
        let ports = NodePorts {
            api: net::scout_port(api_lo..=api_hi).ok_or(LaunchError::NoFreePort("api"))?,
            gateway: net::scout_port(gw_lo..=gw_hi).ok_or(LaunchError::NoFreePort("gateway"))?,
            swarm: net::scout_port(sw_lo..=sw_hi).ok_or(LaunchError::NoFreePort("swarm"))?,
        };
        *guard = Some(ports);
        Ok(ports)
    }

    /// Initialize the repo if empty and write the port configuration.
    async fn provision(&self, ports: NodePorts) -> Result<(), LaunchError> {
        let repo = &self.config.repo_dir;
        let is_empty = match std::fs::read_dir(repo) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        };
        if is_empty {
            std::fs::create_dir_all(repo)
                .map_err(|e| LaunchError::Provision(format!("create repo dir: {e}")))?;
            info!(repo = %repo.display(), "initializing node repo");
            self.run_node_cmd(&["init"]).await?;
        }

        let api_addr = format!("/ip4/127.0.0.1/tcp/{}", ports.api);
        let gateway_addr = format!("/ip4/127.0.0.1/tcp/{}", ports.gateway);
        let swarm_addrs = serde_json::json!([
            format!("/ip4/0.0.0.0/tcp/{}", ports.swarm),
            format!("/ip4/0.0.0.0/udp/{}/quic-v1", ports.swarm),
        ])
        .to_string();

        self.run_node_cmd(&["config", "Addresses.API", &api_addr]).await?;
        self.run_node_cmd(&["config", "Addresses.Gateway", &gateway_addr]).await?;
        self.run_node_cmd(&["config", "--json", "Addresses.Swarm", &swarm_addrs]).await?;
        Ok(())
    }

    /// Run a short-lived node CLI command against the repo.
    async fn run_node_cmd(&self, args: &[&str]) -> Result<String, LaunchError> {
        let output = Command::new(&self.config.bin)
            .args(args)
            .env("IPFS_PATH", &self.config.repo_dir)
            .output()
            .await
            .map_err(|e| LaunchError::Provision(format!("{}: {e}", args.join(" "))))?;
        if !output.status.success() {
            return Err(LaunchError::Provision(format!(
                "{}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn pump_lines<R>(reader: R, label: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "planetd::node", "[{label}] {line}");
    }
    debug!("{label} stream ended");
}
