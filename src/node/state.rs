//! Node lifecycle stages and the `NodeState` snapshot pushed to clients.

use serde::{Deserialize, Serialize};

/// Lifecycle stage of the supervised node process.
///
/// Transitions are restricted to the edges checked by [`NodeStage::can_transition`];
/// the reconciler refuses anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStage {
    /// Daemon has not touched the node yet.
    Unknown,
    /// Launch requested, waiting for the first successful status probe.
    Starting,
    /// Status probe succeeded; node is serving its control API.
    Online,
    /// Terminate requested, waiting for the process to exit.
    Stopping,
    /// Process exited after a user-initiated stop.
    Offline,
    /// Process crashed, failed to start in time, or stopped answering probes.
    Failed,
}

impl NodeStage {
    /// Whether `self → next` is a legal edge of the lifecycle machine.
    pub fn can_transition(self, next: NodeStage) -> bool {
        use NodeStage::*;
        matches!(
            (self, next),
            (Unknown, Starting)
                | (Starting, Online)
                | (Starting, Failed)
                | (Online, Stopping)
                | (Online, Failed)
                | (Stopping, Offline)
                | (Offline, Starting)
                | (Failed, Starting)
        )
    }

    /// A launch or shutdown is in flight.
    pub fn is_operating(self) -> bool {
        matches!(self, NodeStage::Starting | NodeStage::Stopping)
    }

    pub fn is_online(self) -> bool {
        self == NodeStage::Online
    }
}

/// Node identity and peering info sampled from the control API.
///
/// Present only while the node is online and at least one status probe has
/// succeeded since the last transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub host_name: String,
    pub node_version: String,
    pub peer_id: String,
    pub peer_count: usize,
}

/// Immutable snapshot of the node's observed state.
///
/// Replaced wholesale on every transition and on every successful poll sample;
/// consumers only ever need the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub stage: NodeStage,
    pub online: bool,
    /// A launch/shutdown/GC is in flight; `online` reflects the state before
    /// the operation completes.
    pub operating: bool,
    pub api_port: u16,
    pub gateway_port: u16,
    pub swarm_port: u16,
    /// Last sampled repo disk usage; `None` until the first successful sample.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_info: Option<PeerInfo>,
    /// Last observed failure; cleared on the next successful transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeState {
    /// The snapshot published before the daemon has observed anything.
    pub fn unknown(api_port: u16, gateway_port: u16, swarm_port: u16) -> Self {
        Self {
            stage: NodeStage::Unknown,
            online: false,
            operating: false,
            api_port,
            gateway_port,
            swarm_port,
            repo_size_bytes: None,
            peer_info: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NodeStage::*;

    const ALL: [NodeStage; 6] = [Unknown, Starting, Online, Stopping, Offline, Failed];

    #[test]
    fn legal_edges_match_the_lifecycle() {
        assert!(Unknown.can_transition(Starting));
        assert!(Starting.can_transition(Online));
        assert!(Starting.can_transition(Failed));
        assert!(Online.can_transition(Stopping));
        assert!(Online.can_transition(Failed));
        assert!(Stopping.can_transition(Offline));
        assert!(Offline.can_transition(Starting));
        assert!(Failed.can_transition(Starting));
    }

    #[test]
    fn illegal_edges_are_rejected() {
        assert!(!Stopping.can_transition(Online));
        assert!(!Offline.can_transition(Online));
        assert!(!Unknown.can_transition(Online));
        assert!(!Online.can_transition(Starting));
        assert!(!Starting.can_transition(Stopping));
        // No self loops.
        for stage in ALL {
            assert!(!stage.can_transition(stage));
        }
    }

    #[test]
    fn operating_covers_exactly_the_transitional_stages() {
        for stage in ALL {
            assert_eq!(stage.is_operating(), stage == Starting || stage == Stopping);
        }
    }
}
