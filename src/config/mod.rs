use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 5190;
const DEFAULT_NODE_BIN: &str = "ipfs";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_GC_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RETAINED_ROOTS: usize = 3;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── NodeConfig ──────────────────────────────────────────────────────────────

/// Node supervision settings (`[node]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node binary to spawn. Default: "ipfs" (resolved via PATH).
    pub bin: PathBuf,
    /// Initialize and configure the node repo before the first launch. Default: true.
    pub provision: bool,
    /// Launch the node as soon as the daemon starts. Default: true.
    pub auto_launch: bool,
    /// Control API port scouting range, inclusive. Default: [5981, 5991].
    pub api_port_range: [u16; 2],
    /// Gateway port scouting range, inclusive. Default: [18181, 18191].
    pub gateway_port_range: [u16; 2],
    /// Swarm port scouting range, inclusive. Default: [4001, 4011].
    pub swarm_port_range: [u16; 2],
    /// Seconds between health samples while the node is online. Default: 30.
    pub poll_interval_secs: u64,
    /// Seconds to wait for the control API after launch. Default: 30.
    pub startup_timeout_secs: u64,
    /// Seconds of grace between the stop signal and a forced kill. Default: 10.
    pub terminate_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from(DEFAULT_NODE_BIN),
            provision: true,
            auto_launch: true,
            api_port_range: [5981, 5991],
            gateway_port_range: [18181, 18191],
            swarm_port_range: [4001, 4011],
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            terminate_timeout_secs: DEFAULT_TERMINATE_TIMEOUT_SECS,
        }
    }
}

// ─── PublishConfig ───────────────────────────────────────────────────────────

/// Publish and GC tuning (`[publish]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// How many of the newest published roots stay pinned per planet.
    /// Older roots are unpinned and fall to GC. Default: 3, minimum 1.
    pub retained_roots: usize,
    /// Seconds before a GC run is abandoned. Default: 120.
    pub gc_timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retained_roots: DEFAULT_RETAINED_ROOTS,
            gc_timeout_secs: DEFAULT_GC_TIMEOUT_SECS,
        }
    }
}

// ─── TOML config file ────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 5190).
    port: Option<u16>,
    /// Bind address for the WebSocket server (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,planetd=trace" (default: "info").
    log: Option<String>,
    /// Node supervision settings (`[node]`).
    node: Option<NodeConfig>,
    /// Publish and GC tuning (`[publish]`).
    publish: Option<PublishConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Bind address for the WebSocket server (PLANETD_BIND env var).
    pub bind_address: String,
    pub node: NodeConfig,
    pub publish: PublishConfig,
}

impl DaemonConfig {
    /// Build config from CLI args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
        node_bin: Option<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let bind_address = bind_address
            .or(std::env::var("PLANETD_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let mut node = toml.node.unwrap_or_default();
        if let Some(bin) = node_bin.or_else(|| {
            std::env::var("PLANETD_NODE_BIN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
        }) {
            node.bin = bin;
        }

        let mut publish = toml.publish.unwrap_or_default();
        publish.retained_roots = publish.retained_roots.max(1);

        Self { port, data_dir, log, bind_address, node, publish }
    }

    /// Node repository directory, under the daemon data dir.
    pub fn node_repo_dir(&self) -> PathBuf {
        self.data_dir.join("ipfs")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.node.poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.node.startup_timeout_secs)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.node.terminate_timeout_secs)
    }

    pub fn gc_timeout(&self) -> Duration {
        Duration::from_secs(self.publish.gc_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("planetd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("planetd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("planetd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("planetd");
        }
    }
    PathBuf::from(".planetd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = TempDir::new().unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.bind_address, "127.0.0.1");
        assert_eq!(cfg.node.api_port_range, [5981, 5991]);
        assert_eq!(cfg.publish.retained_roots, 3);
        assert!(cfg.node.auto_launch);
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 6000\nlog = \"debug\"\n\n[node]\nbin = \"/opt/kubo/ipfs\"\nauto_launch = false\n\n[publish]\nretained_roots = 5\n",
        )
        .unwrap();

        let cfg = DaemonConfig::new(
            Some(7000),
            Some(dir.path().to_path_buf()),
            None,
            None,
            None,
        );
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.node.bin, PathBuf::from("/opt/kubo/ipfs"));
        assert!(!cfg.node.auto_launch);
        assert_eq!(cfg.publish.retained_roots, 5);
    }

    #[test]
    fn retained_roots_has_a_floor_of_one() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[publish]\nretained_roots = 0\n").unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.publish.retained_roots, 1);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = \"not a number\"").unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
