//! Supervision of the external content-addressed storage node.
//!
//! The node is a black box reached two ways: as a child process
//! ([`process::NodeProcess`]) and over its local control API ([`NodeApi`]).
//! [`reconciler::Reconciler`] folds both views into [`state::NodeState`]
//! snapshots.

pub mod api;
pub mod memory;
pub mod process;
pub mod reconciler;
pub mod state;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A deterministic, content-derived identifier. Identical bytes always yield
/// the identical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub String);

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Node identity as reported by the control API status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub peer_id: String,
    pub node_version: String,
    pub peer_count: usize,
}

/// Repository statistics from the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoStat {
    pub repo_size_bytes: u64,
    pub num_objects: u64,
}

/// Errors from the node control API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The node is not reachable (not launched, shut down, or mid-crash).
    #[error("node is offline")]
    Offline,
    #[error("content not found: {0}")]
    NotFound(ContentId),
    #[error("naming key not found: {0}")]
    KeyNotFound(String),
    /// The naming record moved underneath us; someone else published first.
    #[error("naming sequence conflict: submitted {submitted}, record is at {current}")]
    SequenceConflict { submitted: u64, current: u64 },
    /// Transport-level failure other than connection refused. Retryable.
    #[error("node API transport error: {0}")]
    Transport(String),
    #[error("node API returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl ApiError {
    /// Transient errors worth an automatic retry. Offline, not-found and
    /// sequence conflicts are not — they need caller action.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Status { status: 500..=599, .. })
    }
}

/// The node's local control API, abstracted so the daemon core can run
/// against the HTTP client ([`api::HttpNodeApi`]) or the in-memory backend
/// ([`memory::MemoryNode`]).
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Identity + peering probe. Success means the node is online.
    async fn status(&self) -> Result<NodeStatus, ApiError>;

    /// Add bytes to the store. Idempotent: identical bytes yield the same id
    /// and re-adding stored bytes is a no-op success.
    async fn add(&self, bytes: Vec<u8>) -> Result<ContentId, ApiError>;

    /// Fetch the bytes for a content id.
    async fn cat(&self, id: &ContentId) -> Result<Vec<u8>, ApiError>;

    /// Mark a content root as a GC survivor. Pinning is idempotent and covers
    /// everything reachable from the root.
    async fn pin(&self, id: &ContentId) -> Result<(), ApiError>;

    /// Remove a pin. Unpinning an unpinned id is a no-op success.
    async fn unpin(&self, id: &ContentId) -> Result<(), ApiError>;

    /// Ensure a naming keypair exists under `name`, returning the public name.
    /// Idempotent: an existing key is returned rather than recreated.
    async fn key_gen(&self, name: &str) -> Result<String, ApiError>;

    /// Remove a naming keypair.
    async fn key_rm(&self, name: &str) -> Result<(), ApiError>;

    /// Resolve a mutable name to the content root it currently points at.
    async fn name_resolve(&self, key: &str) -> Result<ContentId, ApiError>;

    /// Point the mutable name at `root`, compare-and-swap on the sequence
    /// number: `seq` must be exactly one past the current record or the call
    /// fails with [`ApiError::SequenceConflict`].
    async fn name_publish(&self, key: &str, root: &ContentId, seq: u64) -> Result<(), ApiError>;

    /// Remove unpinned, unreachable objects. Returns the number reclaimed.
    async fn repo_gc(&self) -> Result<usize, ApiError>;

    async fn repo_stat(&self) -> Result<RepoStat, ApiError>;

    /// Ask the node to stop gracefully.
    async fn shutdown(&self) -> Result<(), ApiError>;
}
