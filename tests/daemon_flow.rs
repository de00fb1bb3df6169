//! End-to-end flow over the real component wiring: node lifecycle, planet and
//! article CRUD, repeated publishes, GC, and planet deletion, all against the
//! in-memory node backend.

use planetd::config::DaemonConfig;
use planetd::node::memory::MemoryNode;
use planetd::node::state::NodeStage;
use planetd::node::NodeApi;
use planetd::AppContext;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn make_ctx(dir: &TempDir) -> (Arc<MemoryNode>, Arc<AppContext>) {
    let config = DaemonConfig::new(
        None,
        Some(dir.path().to_path_buf()),
        Some("error".to_string()),
        None,
        None,
    );
    let node = Arc::new(MemoryNode::new());
    let ctx = AppContext::build(config, node.clone(), None).unwrap();
    (node, ctx)
}

#[tokio::test]
async fn full_author_publish_gc_delete_cycle() {
    let dir = TempDir::new().unwrap();
    let (node, ctx) = make_ctx(&dir);

    ctx.reconciler.launch().await.unwrap();
    assert_eq!(ctx.reconciler.stage().await, NodeStage::Online);

    let planet = ctx.registry.create_planet("Journal", "notes", "Plain").await.unwrap();
    let article = ctx.registry.create_article(planet.id, "Day 1", "it begins").await.unwrap();
    ctx.registry.create_article(planet.id, "Day 2", "it continues").await.unwrap();

    let first = ctx.pipeline.publish(planet.id).await.unwrap();
    assert_eq!(first.naming_sequence_number, 1);
    assert_eq!(first.article_count, 2);

    // The published site is reachable: the root resolves and embeds both
    // articles, which GC therefore keeps.
    let resolved = node.name_resolve(&planet.naming_key_ref).await.unwrap();
    assert_eq!(resolved, first.root_content_id);
    let garbage = node.add(b"left over from an abandoned run".to_vec()).await.unwrap();
    let reclaimed = ctx.store.gc(Duration::from_secs(5)).await.unwrap();
    assert!(reclaimed >= 1);
    assert!(node.cat(&first.root_content_id).await.is_ok());
    assert!(node.cat(&garbage).await.is_err());

    // Edit and republish.
    ctx.registry
        .update_article(planet.id, article.id, |a| a.content = "rewritten".to_string())
        .await
        .unwrap();
    let second = ctx.pipeline.publish(planet.id).await.unwrap();
    assert_eq!(second.naming_sequence_number, 2);
    assert_ne!(second.root_content_id, first.root_content_id);

    // Deleting the planet releases its pins and naming key.
    let (deleted, roots) = ctx.registry.delete_planet(planet.id).await.unwrap();
    assert_eq!(roots.len(), 2);
    for root in &roots {
        ctx.store.unpin(root).await.unwrap();
    }
    node.key_rm(&deleted.naming_key_ref).await.unwrap();
    assert!(node.name_resolve(&deleted.naming_key_ref).await.is_err());

    let reclaimed = ctx.store.gc(Duration::from_secs(5)).await.unwrap();
    assert!(reclaimed >= 2, "both site roots should be collectable, got {reclaimed}");

    ctx.reconciler.shutdown().await.unwrap();
    assert_eq!(ctx.reconciler.stage().await, NodeStage::Offline);
}

#[tokio::test]
async fn registry_state_survives_a_daemon_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (_node, ctx) = make_ctx(&dir);
        let planet = ctx.registry.create_planet("Persist", "", "Plain").await.unwrap();
        ctx.registry.create_article(planet.id, "kept", "still here").await.unwrap();
        ctx.pipeline.publish(planet.id).await.unwrap();
    }

    // Fresh wiring over the same data dir.
    let (_node, ctx) = make_ctx(&dir);
    let planets = ctx.registry.planets().await;
    assert_eq!(planets.len(), 1);
    assert_eq!(planets[0].name, "Persist");
    assert!(planets[0].last_published_root.is_some());
    // The restart remembers the sequence, so the next publish carries seq 2
    // even though the in-memory node's record was lost with the old backend.
    assert_eq!(ctx.registry.next_sequence(planets[0].id).await.unwrap(), 2);
}

#[tokio::test]
async fn gc_never_runs_between_pin_and_name_publish() {
    let dir = TempDir::new().unwrap();
    let (node, ctx) = make_ctx(&dir);
    let planet = ctx.registry.create_planet("Racy", "", "Plain").await.unwrap();
    let article = ctx.registry.create_article(planet.id, "a", "v0").await.unwrap();

    // Hammer publishes and GCs concurrently; every publish that succeeds must
    // leave its root resolvable and stored.
    for round in 0..10u32 {
        ctx.registry
            .update_article(planet.id, article.id, |a| a.content = format!("v{round}"))
            .await
            .unwrap();
        let publish = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.pipeline.publish(planet.id).await })
        };
        let gc = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.store.gc(Duration::from_secs(5)).await })
        };

        let record = publish.await.unwrap().unwrap();
        gc.await.unwrap().unwrap();

        let resolved = node.name_resolve(&planet.naming_key_ref).await.unwrap();
        assert_eq!(resolved, record.root_content_id);
        assert!(
            node.cat(&record.root_content_id).await.is_ok(),
            "round {round}: published root was collected"
        );
    }
}

#[tokio::test]
async fn node_crash_is_survived_and_relaunchable() {
    let dir = TempDir::new().unwrap();
    let (node, ctx) = make_ctx(&dir);
    ctx.reconciler.launch().await.unwrap();

    // The node goes away mid-flight.
    node.set_offline(true);
    for _ in 0..3 {
        ctx.reconciler.poll_once().await;
    }
    assert_eq!(ctx.reconciler.stage().await, NodeStage::Failed);

    // Publishing against a failed node is a typed offline error, not a hang.
    let planet = ctx.registry.create_planet("Offline", "", "Plain").await.unwrap();
    assert!(matches!(
        ctx.pipeline.publish(planet.id).await,
        Err(planetd::publish::PublishError::DaemonOffline)
    ));

    // Failed is a restartable stage.
    node.set_offline(false);
    ctx.reconciler.launch().await.unwrap();
    assert_eq!(ctx.reconciler.stage().await, NodeStage::Online);
    ctx.pipeline.publish(planet.id).await.unwrap();
}
