//! Publish pipeline: registry snapshot → content objects → naming update.
//!
//! A run walks six steps: snapshot the planet, resolve attachments, build and
//! add the article and index objects, pin the new root, update the naming
//! record under sequence CAS, then record the result. Nothing in the registry
//! moves until the naming update has succeeded, so any failure leaves the
//! previous publish fully intact; objects added before the failure are
//! unpinned garbage and fall to the next GC.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventBroadcaster, PublishStage};
use crate::node::{ApiError, ContentId, NodeApi};
use crate::registry::{Article, Planet, PublishRecord, Registry, RegistryError};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::store::ContentStore;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("a publish for planet {0} is already running")]
    InProgress(Uuid),
    #[error("planet not found: {0}")]
    PlanetNotFound(Uuid),
    #[error("node is offline")]
    DaemonOffline,
    #[error("naming record moved underneath us (submitted {submitted}, current {current})")]
    NamingConflict { submitted: u64, current: u64 },
    #[error("article {article_id} references unresolved attachment {name:?}")]
    UnresolvedAttachment { article_id: Uuid, name: String },
    #[error("node API error: {0}")]
    Api(ApiError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<ApiError> for PublishError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Offline => PublishError::DaemonOffline,
            ApiError::SequenceConflict { submitted, current } => {
                PublishError::NamingConflict { submitted, current }
            }
            other => PublishError::Api(other),
        }
    }
}

/// Wire form of one published article.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArticleObject<'a> {
    id: Uuid,
    title: &'a str,
    content: &'a str,
    attachments: &'a [crate::registry::Attachment],
    tags: &'a std::collections::BTreeSet<String>,
    created: chrono::DateTime<Utc>,
    updated: chrono::DateTime<Utc>,
}

/// Wire form of the site root. Embeds every article's content id, which makes
/// the root the reachability anchor for the whole site.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexObject<'a> {
    planet_id: Uuid,
    name: &'a str,
    about: &'a str,
    template: &'a str,
    articles: Vec<IndexEntry<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry<'a> {
    id: Uuid,
    title: &'a str,
    content_id: ContentId,
    attachments: Vec<ContentId>,
}

pub struct PublishPipeline {
    api: Arc<dyn NodeApi>,
    store: Arc<ContentStore>,
    registry: Arc<Registry>,
    broadcaster: Arc<EventBroadcaster>,
    retry: RetryConfig,
    /// Newest published roots kept pinned per planet.
    retained_roots: usize,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Releases the per-planet in-flight slot however the run ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    planet_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().expect("in-flight lock").remove(&self.planet_id);
    }
}

impl PublishPipeline {
    pub fn new(
        api: Arc<dyn NodeApi>,
        store: Arc<ContentStore>,
        registry: Arc<Registry>,
        broadcaster: Arc<EventBroadcaster>,
        retry: RetryConfig,
        retained_roots: usize,
    ) -> Self {
        Self {
            api,
            store,
            registry,
            broadcaster,
            retry,
            retained_roots: retained_roots.max(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Publish the current state of a planet.
    ///
    /// At most one run per planet at a time; a second call while one is in
    /// flight fails with [`PublishError::InProgress`] instead of queueing.
    pub async fn publish(&self, planet_id: Uuid) -> Result<PublishRecord, PublishError> {
        let _slot = {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock");
            if !in_flight.insert(planet_id) {
                return Err(PublishError::InProgress(planet_id));
            }
            InFlightGuard { set: &self.in_flight, planet_id }
        };

        // Keeps GC out for the whole run.
        let _publish_guard = self.store.begin_publish().await;

        let planet = match self.registry.get_planet(planet_id).await {
            Ok(p) => p,
            Err(RegistryError::PlanetNotFound(id)) => return Err(PublishError::PlanetNotFound(id)),
            Err(e) => return Err(e.into()),
        };

        // Step 1: freeze the article set. Edits from here on land in the next
        // run. Sorted by id so identical content always builds identical
        // objects in identical order.
        let mut articles = self.registry.articles(planet_id).await?;
        articles.sort_by_key(|a| a.id);
        self.progress(planet_id, PublishStage::Snapshot);

        // Step 2: every referenced attachment must already be resolvable.
        self.resolve_attachments(&articles).await?;
        self.progress(planet_id, PublishStage::Attachments);

        // Step 3: build the site objects bottom-up, ending with the root.
        let root = self.build_root(&planet, &articles).await?;
        self.progress(planet_id, PublishStage::BuildRoot);

        // Step 4: pin before naming so the root can never be collected while
        // the record points at it.
        self.store.pin(&root).await?;
        self.progress(planet_id, PublishStage::Pin);

        // Step 5: naming update under sequence CAS. key_gen is idempotent, so
        // a planet created while the node was offline gets its key here on
        // first publish. Only transport-level failures are retried; a
        // sequence conflict or offline node surfaces immediately.
        self.api.key_gen(&planet.naming_key_ref).await?;
        let seq = self.registry.next_sequence(planet_id).await?;
        self.progress(planet_id, PublishStage::NamePublish);
        let named = retry_with_backoff(&self.retry, ApiError::is_transient, || {
            self.api.name_publish(&planet.naming_key_ref, &root, seq)
        })
        .await;
        if let Err(ApiError::SequenceConflict { submitted, current }) = &named {
            // A foreign writer moved the record. Remember where it actually
            // is; the next attempt submits one past it instead of replaying
            // the same stale sequence forever.
            warn!(
                planet_id = %planet_id,
                submitted = *submitted,
                current = *current,
                "naming record moved underneath us"
            );
            self.registry.observe_sequence(planet_id, *current).await?;
        }
        named?;

        // Step 6: the naming record moved — from here the publish has
        // happened and only local bookkeeping remains.
        let record = PublishRecord {
            root_content_id: root.clone(),
            naming_sequence_number: seq,
            published_at: Utc::now(),
            article_count: articles.len(),
        };
        let roots = self.registry.record_publish(planet_id, record.clone()).await?;
        self.trim_pin_window(&roots).await;

        info!(planet_id = %planet_id, root = %root, seq, "publish complete");
        self.progress(planet_id, PublishStage::Complete);
        Ok(record)
    }

    async fn resolve_attachments(&self, articles: &[Article]) -> Result<(), PublishError> {
        for article in articles {
            for attachment in &article.attachments {
                match self.store.get(&attachment.content_id).await {
                    Ok(_) => {}
                    Err(ApiError::NotFound(_)) => {
                        return Err(PublishError::UnresolvedAttachment {
                            article_id: article.id,
                            name: attachment.name.clone(),
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Add one object per article plus the index object; returns the root id.
    async fn build_root(
        &self,
        planet: &Planet,
        articles: &[Article],
    ) -> Result<ContentId, PublishError> {
        let mut entries = Vec::with_capacity(articles.len());
        for article in articles {
            let object = ArticleObject {
                id: article.id,
                title: &article.title,
                content: &article.content,
                attachments: &article.attachments,
                tags: &article.tags,
                created: article.created,
                updated: article.updated,
            };
            let bytes = serde_json::to_vec(&object).map_err(RegistryError::Corrupt)?;
            let content_id = self.store.put(bytes).await?;
            entries.push(IndexEntry {
                id: article.id,
                title: &article.title,
                content_id,
                attachments: article.attachments.iter().map(|a| a.content_id.clone()).collect(),
            });
        }

        let index = IndexObject {
            planet_id: planet.id,
            name: &planet.name,
            about: &planet.about,
            template: &planet.template,
            articles: entries,
        };
        let bytes = serde_json::to_vec(&index).map_err(RegistryError::Corrupt)?;
        Ok(self.store.put(bytes).await?)
    }

    /// Unpin roots that fell out of the retained window (oldest-first input).
    /// Unpin failures are logged, never fatal — the publish already succeeded.
    async fn trim_pin_window(&self, roots: &[ContentId]) {
        if roots.len() <= self.retained_roots {
            return;
        }
        for stale in &roots[..roots.len() - self.retained_roots] {
            if let Err(e) = self.store.unpin(stale).await {
                warn!(root = %stale, err = %e, "failed to unpin stale root");
            }
        }
    }

    fn progress(&self, planet_id: Uuid, stage: PublishStage) {
        self.broadcaster.publish_progress(planet_id, stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::memory::MemoryNode;
    use crate::node::state::NodeState;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        node: Arc<MemoryNode>,
        registry: Arc<Registry>,
        pipeline: PublishPipeline,
    }

    fn fixture_with_window(retained_roots: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let node = Arc::new(MemoryNode::new());
        let bus = Arc::new(EventBroadcaster::new(NodeState::unknown(5981, 18181, 4001)));
        let registry = Arc::new(Registry::load(dir.path(), bus.clone()).unwrap());
        let store = Arc::new(ContentStore::new(node.clone()));
        let pipeline = PublishPipeline::new(
            node.clone(),
            store,
            registry.clone(),
            bus,
            RetryConfig::instant(),
            retained_roots,
        );
        Fixture { _dir: dir, node, registry, pipeline }
    }

    fn fixture() -> Fixture {
        fixture_with_window(3)
    }

    #[tokio::test]
    async fn first_publish_pins_the_root_at_sequence_one() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "about", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "Hello", "world").await.unwrap();

        let record = f.pipeline.publish(planet.id).await.unwrap();
        assert_eq!(record.naming_sequence_number, 1);
        assert_eq!(record.article_count, 1);
        assert!(f.node.is_pinned(&record.root_content_id));
        assert_eq!(
            f.node.name_resolve(&planet.naming_key_ref).await.unwrap(),
            record.root_content_id
        );
    }

    #[tokio::test]
    async fn republishing_changed_content_advances_the_sequence() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        let article = f.registry.create_article(planet.id, "a", "one").await.unwrap();

        let first = f.pipeline.publish(planet.id).await.unwrap();
        f.registry
            .update_article(planet.id, article.id, |a| a.content = "two".to_string())
            .await
            .unwrap();
        let second = f.pipeline.publish(planet.id).await.unwrap();

        assert_eq!(second.naming_sequence_number, 2);
        assert_ne!(first.root_content_id, second.root_content_id);
        // Both roots stay pinned inside the retained window.
        assert!(f.node.is_pinned(&first.root_content_id));
        assert!(f.node.is_pinned(&second.root_content_id));
        assert_eq!(f.node.record_seq(&planet.naming_key_ref), Some(2));
    }

    #[tokio::test]
    async fn roots_outside_the_retained_window_are_unpinned() {
        let f = fixture_with_window(2);
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        let article = f.registry.create_article(planet.id, "a", "v0").await.unwrap();

        let mut roots = Vec::new();
        for v in 1..=4u32 {
            f.registry
                .update_article(planet.id, article.id, |a| a.content = format!("v{v}"))
                .await
                .unwrap();
            roots.push(f.pipeline.publish(planet.id).await.unwrap().root_content_id);
        }

        assert!(!f.node.is_pinned(&roots[0]));
        assert!(!f.node.is_pinned(&roots[1]));
        assert!(f.node.is_pinned(&roots[2]));
        assert!(f.node.is_pinned(&roots[3]));
    }

    #[tokio::test]
    async fn failed_add_leaves_the_previous_publish_intact() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        let article = f.registry.create_article(planet.id, "a", "one").await.unwrap();
        let first = f.pipeline.publish(planet.id).await.unwrap();

        f.registry
            .update_article(planet.id, article.id, |a| a.content = "two".to_string())
            .await
            .unwrap();
        f.node.fail_next_add();
        assert!(matches!(f.pipeline.publish(planet.id).await, Err(PublishError::Api(_))));

        // Naming record and registry still point at the first publish.
        assert_eq!(
            f.node.name_resolve(&planet.naming_key_ref).await.unwrap(),
            first.root_content_id
        );
        let planet = f.registry.get_planet(planet.id).await.unwrap();
        assert_eq!(planet.last_published_root, Some(first.root_content_id));
        assert_eq!(f.registry.next_sequence(planet.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_pin_records_nothing() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        f.node.fail_next_pin();
        assert!(matches!(f.pipeline.publish(planet.id).await, Err(PublishError::Api(_))));
        assert!(f.registry.history(planet.id).await.unwrap().is_empty());
        assert_eq!(f.registry.next_sequence(planet.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_name_publish_failure_is_retried_to_success() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        f.node.fail_next_name_publish();
        let record = f.pipeline.publish(planet.id).await.unwrap();
        assert_eq!(record.naming_sequence_number, 1);
        assert_eq!(f.node.record_seq(&planet.naming_key_ref), Some(1));
    }

    #[tokio::test]
    async fn stale_sequence_surfaces_as_a_naming_conflict() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        // Another writer moved the record past what the registry knows.
        f.node.key_gen(&planet.naming_key_ref).await.unwrap();
        let foreign = f.node.add(b"foreign root".to_vec()).await.unwrap();
        f.node.name_publish(&planet.naming_key_ref, &foreign, 1).await.unwrap();

        let err = f.pipeline.publish(planet.id).await.unwrap_err();
        assert!(matches!(err, PublishError::NamingConflict { submitted: 1, current: 1 }));
        assert!(f.registry.history(planet.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_recovers_after_a_foreign_naming_update() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        // Another writer advanced the record before our first run.
        f.node.key_gen(&planet.naming_key_ref).await.unwrap();
        let foreign = f.node.add(b"foreign root".to_vec()).await.unwrap();
        f.node.name_publish(&planet.naming_key_ref, &foreign, 1).await.unwrap();

        // The first run loses the race; the retry lines up with where the
        // record actually is and wins.
        assert!(matches!(
            f.pipeline.publish(planet.id).await,
            Err(PublishError::NamingConflict { submitted: 1, current: 1 })
        ));
        let record = f.pipeline.publish(planet.id).await.unwrap();
        assert_eq!(record.naming_sequence_number, 2);
        assert_eq!(f.node.record_seq(&planet.naming_key_ref), Some(2));
        assert_eq!(
            f.node.name_resolve(&planet.naming_key_ref).await.unwrap(),
            record.root_content_id
        );
    }

    #[tokio::test]
    async fn offline_node_maps_to_daemon_offline() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.node.set_offline(true);
        assert!(matches!(f.pipeline.publish(planet.id).await, Err(PublishError::DaemonOffline)));
    }

    #[tokio::test]
    async fn unknown_attachment_fails_before_any_object_is_built() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        let article = f.registry.create_article(planet.id, "a", "one").await.unwrap();
        f.registry
            .update_article(planet.id, article.id, |a| {
                a.attachments.push(crate::registry::Attachment {
                    name: "missing.png".to_string(),
                    content_id: ContentId::from("bafm-not-there"),
                    mime_type: "image/png".to_string(),
                    size: 10,
                })
            })
            .await
            .unwrap();

        let before = f.node.object_count();
        let err = f.pipeline.publish(planet.id).await.unwrap_err();
        assert!(matches!(err, PublishError::UnresolvedAttachment { .. }));
        assert_eq!(f.node.object_count(), before);
    }

    #[tokio::test]
    async fn a_publish_while_the_slot_is_held_is_turned_away() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        // Occupy the per-planet slot as an in-flight run would.
        f.pipeline.in_flight.lock().unwrap().insert(planet.id);
        assert!(matches!(
            f.pipeline.publish(planet.id).await,
            Err(PublishError::InProgress(id)) if id == planet.id
        ));
        assert!(f.registry.history(planet.id).await.unwrap().is_empty());

        // Once the slot frees up the same call goes through.
        f.pipeline.in_flight.lock().unwrap().remove(&planet.id);
        f.pipeline.publish(planet.id).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_publishes_of_one_planet_run_exactly_once() {
        let f = fixture();
        let planet = f.registry.create_planet("Site", "", "Plain").await.unwrap();
        f.registry.create_article(planet.id, "a", "one").await.unwrap();

        let pipeline = Arc::new(f.pipeline);
        let a = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.publish(planet.id).await })
        };
        let b = {
            let p = Arc::clone(&pipeline);
            tokio::spawn(async move { p.publish(planet.id).await })
        };
        let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

        let succeeded = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        let rejected = [&ra, &rb]
            .iter()
            .filter(|r| matches!(r, Err(PublishError::InProgress(_))))
            .count();
        // Either both finished sequentially or one was turned away; the
        // sequence numbers must stay consistent either way.
        assert!(succeeded >= 1);
        assert_eq!(succeeded + rejected, 2);
        let history = f.registry.history(planet.id).await.unwrap();
        assert_eq!(history.len(), succeeded);
        for (i, record) in history.iter().enumerate() {
            assert_eq!(record.naming_sequence_number, i as u64 + 1);
        }
    }
}
