//! In-memory node backend.
//!
//! Implements the full control API contract against process-local state:
//! sha256-derived content ids, a pin set, naming records with sequence
//! compare-and-swap. Used by the test suite and by `--memory-node` for
//! offline development. Fault-injection switches let tests fail any single
//! step of a publish.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ApiError, ContentId, NodeApi, NodeStatus, RepoStat};

#[derive(Debug, Clone)]
struct NamingRecord {
    value: ContentId,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ContentId, Vec<u8>>,
    pins: HashSet<ContentId>,
    /// key name → public naming id
    keys: HashMap<String, String>,
    /// key name → current record
    names: HashMap<String, NamingRecord>,
}

#[derive(Default)]
pub struct MemoryNode {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    fail_next_add: AtomicBool,
    fail_next_pin: AtomicBool,
    fail_next_name_publish: AtomicBool,
}

impl MemoryNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the node going down (all calls return `Offline`) or back up.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next_add(&self) {
        self.fail_next_add.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_pin(&self) {
        self.fail_next_pin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_name_publish(&self) {
        self.fail_next_name_publish.store(true, Ordering::SeqCst);
    }

    pub fn is_pinned(&self, id: &ContentId) -> bool {
        self.inner.lock().expect("memory node lock").pins.contains(id)
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().expect("memory node lock").objects.len()
    }

    /// Current sequence number of a naming record, if any.
    pub fn record_seq(&self, key: &str) -> Option<u64> {
        self.inner.lock().expect("memory node lock").names.get(key).map(|r| r.seq)
    }

    fn check_online(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ApiError::Offline)
        } else {
            Ok(())
        }
    }

    fn content_id(bytes: &[u8]) -> ContentId {
        let digest = Sha256::digest(bytes);
        ContentId(format!("bafm{}", hex::encode(digest)))
    }
}

#[async_trait]
impl NodeApi for MemoryNode {
    async fn status(&self) -> Result<NodeStatus, ApiError> {
        self.check_online()?;
        Ok(NodeStatus {
            peer_id: "12D3MemoryNodePeer".to_string(),
            node_version: "memory-0.1".to_string(),
            peer_count: 0,
        })
    }

    async fn add(&self, bytes: Vec<u8>) -> Result<ContentId, ApiError> {
        self.check_online()?;
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Transport("injected add failure".to_string()));
        }
        let id = Self::content_id(&bytes);
        self.inner
            .lock()
            .expect("memory node lock")
            .objects
            .entry(id.clone())
            .or_insert(bytes);
        Ok(id)
    }

    async fn cat(&self, id: &ContentId) -> Result<Vec<u8>, ApiError> {
        self.check_online()?;
        self.inner
            .lock()
            .expect("memory node lock")
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(id.clone()))
    }

    async fn pin(&self, id: &ContentId) -> Result<(), ApiError> {
        self.check_online()?;
        if self.fail_next_pin.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Transport("injected pin failure".to_string()));
        }
        let mut inner = self.inner.lock().expect("memory node lock");
        if !inner.objects.contains_key(id) {
            return Err(ApiError::NotFound(id.clone()));
        }
        inner.pins.insert(id.clone());
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ApiError> {
        self.check_online()?;
        self.inner.lock().expect("memory node lock").pins.remove(id);
        Ok(())
    }

    async fn key_gen(&self, name: &str) -> Result<String, ApiError> {
        self.check_online()?;
        let mut inner = self.inner.lock().expect("memory node lock");
        if let Some(existing) = inner.keys.get(name) {
            return Ok(existing.clone());
        }
        let public = format!("k51{}", hex::encode(&Sha256::digest(name.as_bytes())[..16]));
        inner.keys.insert(name.to_string(), public.clone());
        Ok(public)
    }

    async fn key_rm(&self, name: &str) -> Result<(), ApiError> {
        self.check_online()?;
        let mut inner = self.inner.lock().expect("memory node lock");
        if inner.keys.remove(name).is_none() {
            return Err(ApiError::KeyNotFound(name.to_string()));
        }
        inner.names.remove(name);
        Ok(())
    }

    async fn name_resolve(&self, key: &str) -> Result<ContentId, ApiError> {
        self.check_online()?;
        self.inner
            .lock()
            .expect("memory node lock")
            .names
            .get(key)
            .map(|r| r.value.clone())
            .ok_or_else(|| ApiError::KeyNotFound(key.to_string()))
    }

    async fn name_publish(&self, key: &str, root: &ContentId, seq: u64) -> Result<(), ApiError> {
        self.check_online()?;
        if self.fail_next_name_publish.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Transport("injected name publish failure".to_string()));
        }
        let mut inner = self.inner.lock().expect("memory node lock");
        if !inner.keys.contains_key(key) {
            return Err(ApiError::KeyNotFound(key.to_string()));
        }
        let current = inner.names.get(key).map_or(0, |r| r.seq);
        if seq != current + 1 {
            return Err(ApiError::SequenceConflict { submitted: seq, current });
        }
        inner.names.insert(key.to_string(), NamingRecord { value: root.clone(), seq });
        Ok(())
    }

    async fn repo_gc(&self) -> Result<usize, ApiError> {
        self.check_online()?;
        let mut inner = self.inner.lock().expect("memory node lock");

        // Reachability: everything transitively referenced from a pin
        // survives. A reference is the id of another stored object appearing
        // in the object bytes, which is how the index objects link articles.
        let mut reachable: HashSet<ContentId> = HashSet::new();
        let mut queue: VecDeque<ContentId> = inner.pins.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            let Some(bytes) = inner.objects.get(&id) else { continue };
            let text = String::from_utf8_lossy(bytes);
            for candidate in inner.objects.keys() {
                if *candidate != id && !reachable.contains(candidate) && text.contains(&candidate.0)
                {
                    queue.push_back(candidate.clone());
                }
            }
        }

        let before = inner.objects.len();
        inner.objects.retain(|id, _| reachable.contains(id));
        Ok(before - inner.objects.len())
    }

    async fn repo_stat(&self) -> Result<RepoStat, ApiError> {
        self.check_online()?;
        let inner = self.inner.lock().expect("memory node lock");
        let size: usize = inner.objects.values().map(Vec::len).sum();
        Ok(RepoStat { repo_size_bytes: size as u64, num_objects: inner.objects.len() as u64 })
    }

    async fn shutdown(&self) -> Result<(), ApiError> {
        self.set_offline(true);
        Ok(())
    }
}
