pub mod config;
pub mod events;
pub mod ipc;
pub mod net;
pub mod node;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use config::DaemonConfig;
use events::EventBroadcaster;
use node::process::{NodePorts, NodeProcess};
use node::reconciler::{Reconciler, ReconcilerConfig};
use node::state::NodeState;
use node::NodeApi;
use publish::PublishPipeline;
use registry::Registry;
use retry::RetryConfig;
use store::ContentStore;

/// Shared application state passed to every RPC handler and background task.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub api: Arc<dyn NodeApi>,
    pub reconciler: Arc<Reconciler>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub registry: Arc<Registry>,
    pub store: Arc<ContentStore>,
    pub pipeline: Arc<PublishPipeline>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the daemon components around a node backend.
    ///
    /// `process` is `None` when the node is externally managed (or backed by
    /// the in-memory node) — the reconciler then supervises over the control
    /// API alone.
    pub fn build(
        config: DaemonConfig,
        api: Arc<dyn NodeApi>,
        process: Option<Arc<NodeProcess>>,
    ) -> Result<Arc<Self>> {
        let default_ports = NodePorts {
            api: config.node.api_port_range[0],
            gateway: config.node.gateway_port_range[0],
            swarm: config.node.swarm_port_range[0],
        };
        let broadcaster = Arc::new(EventBroadcaster::new(NodeState::unknown(
            default_ports.api,
            default_ports.gateway,
            default_ports.swarm,
        )));
        let registry = Arc::new(Registry::load(&config.data_dir, broadcaster.clone())?);
        let store = Arc::new(ContentStore::new(api.clone()));
        let pipeline = Arc::new(PublishPipeline::new(
            api.clone(),
            store.clone(),
            registry.clone(),
            broadcaster.clone(),
            RetryConfig::default(),
            config.publish.retained_roots,
        ));
        let reconciler = Reconciler::new(
            api.clone(),
            process,
            broadcaster.clone(),
            ReconcilerConfig {
                startup_timeout: config.startup_timeout(),
                terminate_timeout: config.terminate_timeout(),
                poll_interval: config.poll_interval(),
                default_ports,
            },
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            api,
            reconciler,
            broadcaster,
            registry,
            store,
            pipeline,
            started_at: std::time::Instant::now(),
        }))
    }
}
