use anyhow::Result;
use clap::Parser;
use planetd::config::DaemonConfig;
use planetd::node::api::HttpNodeApi;
use planetd::node::memory::MemoryNode;
use planetd::node::process::{NodeProcess, NodeProcessConfig};
use planetd::{ipc, AppContext};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "planetd", about = "Planet publishing daemon", version)]
struct Args {
    /// JSON-RPC WebSocket server port
    #[arg(long, env = "PLANETD_PORT")]
    port: Option<u16>,

    /// Data directory for planets, node repo, and config
    #[arg(long, env = "PLANETD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PLANETD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1)
    #[arg(long, env = "PLANETD_BIND")]
    bind_address: Option<String>,

    /// Path to the node binary (default: "ipfs" from PATH)
    #[arg(long, env = "PLANETD_NODE_BIN")]
    node_bin: Option<std::path::PathBuf>,

    /// Use the in-memory node backend instead of spawning a real node.
    /// Content lives only for the daemon's lifetime — development use only.
    #[arg(long)]
    memory_node: bool,

    /// Do not launch the node at startup (it can still be launched over RPC)
    #[arg(long)]
    no_auto_launch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DaemonConfig::new(
        args.port,
        args.data_dir,
        args.log,
        args.bind_address,
        args.node_bin,
    );

    // Init once — must happen before any tracing calls.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log))
        .compact()
        .init();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "planetd starting"
    );

    let auto_launch = config.node.auto_launch && !args.no_auto_launch;

    let ctx = if args.memory_node {
        info!("using in-memory node backend");
        AppContext::build(config, Arc::new(MemoryNode::new()), None)?
    } else {
        let process = NodeProcess::new(NodeProcessConfig {
            bin: config.node.bin.clone(),
            repo_dir: config.node_repo_dir(),
            daemon_args: vec!["daemon".to_string(), "--migrate=true".to_string()],
            api_port_range: (config.node.api_port_range[0], config.node.api_port_range[1]),
            gateway_port_range: (
                config.node.gateway_port_range[0],
                config.node.gateway_port_range[1],
            ),
            swarm_port_range: (config.node.swarm_port_range[0], config.node.swarm_port_range[1]),
            provision: config.node.provision,
        });
        let api = Arc::new(HttpNodeApi::new(process.ports_handle()));
        AppContext::build(config, api, Some(process))?
    };

    // Health sampling runs for the life of the daemon.
    let _poll_task = ctx.reconciler.spawn_poll_task();

    if auto_launch {
        // A failed launch is not fatal — the node can be launched over RPC
        // once the underlying problem is fixed.
        if let Err(e) = ctx.reconciler.launch().await {
            warn!(err = %e, "node auto-launch failed");
        }
    }

    ipc::run(ctx).await
}
