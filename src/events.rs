//! Typed event fan-out to IPC subscribers.
//!
//! Single writer (reconciler / registry / publish pipeline), many readers
//! (one per WebSocket connection). The channel is bounded; a subscriber that
//! falls behind loses the oldest entries first, which is safe because every
//! event kind is a full snapshot — only the latest one matters. The current
//! `NodeState` is cached so a late joiner starts from it instead of waiting
//! for the next transition.

use std::sync::RwLock;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::node::state::NodeState;
use crate::registry::Planet;

const CHANNEL_CAPACITY: usize = 256;

/// Progress marker pushed while a publish run advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PublishStage {
    Snapshot,
    Attachments,
    BuildRoot,
    Pin,
    NamePublish,
    Complete,
}

#[derive(Debug, Clone)]
pub enum Event {
    NodeStateChanged(NodeState),
    /// Full registry snapshot — not a diff. Planet counts are small enough
    /// that the simpler consumer contract wins.
    PlanetsChanged(Vec<Planet>),
    PublishProgress { planet_id: Uuid, stage: PublishStage },
}

pub struct EventBroadcaster {
    tx: broadcast::Sender<Event>,
    latest_node_state: RwLock<NodeState>,
}

impl EventBroadcaster {
    pub fn new(initial: NodeState) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, latest_node_state: RwLock::new(initial) }
    }

    /// Subscribe, receiving the current node state for cold-start catch-up
    /// along with the live stream.
    pub fn subscribe(&self) -> (NodeState, broadcast::Receiver<Event>) {
        // Subscribe before reading the snapshot so a transition that lands in
        // between is seen on the stream rather than lost.
        let rx = self.tx.subscribe();
        let current = self.current_node_state();
        (current, rx)
    }

    pub fn current_node_state(&self) -> NodeState {
        self.latest_node_state.read().expect("state lock poisoned").clone()
    }

    pub fn node_state_changed(&self, state: NodeState) {
        *self.latest_node_state.write().expect("state lock poisoned") = state.clone();
        // No subscribers is fine.
        let _ = self.tx.send(Event::NodeStateChanged(state));
    }

    pub fn planets_changed(&self, planets: Vec<Planet>) {
        let _ = self.tx.send(Event::PlanetsChanged(planets));
    }

    pub fn publish_progress(&self, planet_id: Uuid, stage: PublishStage) {
        let _ = self.tx.send(Event::PublishProgress { planet_id, stage });
    }
}
