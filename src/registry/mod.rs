//! Catalog of locally authored planets and their articles.
//!
//! The registry is the in-memory source of truth the publish pipeline reads
//! from and the IPC layer mutates. Every record is mirrored as a JSON
//! document under the data directory (`My/<planet>/planet.json`,
//! `My/<planet>/Articles/<article>.json`, `My/<planet>/history.json`) so the
//! daemon can restart without losing anything.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::events::EventBroadcaster;
use crate::node::ContentId;

// ─── Records ─────────────────────────────────────────────────────────────────

/// A user-authored site bound to one mutable naming record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Planet {
    pub id: Uuid,
    pub name: String,
    pub about: String,
    pub template: String,
    /// Name of the node keystore keypair that signs this planet's naming
    /// record. Exactly one planet owns one key; the key material itself is
    /// created in the node keystore at first publish.
    pub naming_key_ref: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Advances only through successful publish runs, never past a failed
    /// naming update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_published_root: Option<ContentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_published_at: Option<DateTime<Utc>>,
    /// Highest naming-record sequence seen at the node, including records
    /// moved by writers other than this daemon. Raised when a publish hits a
    /// sequence conflict so the next attempt lines up with reality.
    #[serde(default, skip_serializing_if = "sequence_is_zero")]
    pub observed_sequence: u64,
}

fn sequence_is_zero(seq: &u64) -> bool {
    *seq == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content_id: ContentId,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: Uuid,
    pub planet_id: Uuid,
    pub title: String,
    /// Markdown source.
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Append-only publish history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRecord {
    pub root_content_id: ContentId,
    /// Strictly increasing per planet; detects stale concurrent publishes.
    pub naming_sequence_number: u64,
    pub published_at: DateTime<Utc>,
    pub article_count: usize,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("planet not found: {0}")]
    PlanetNotFound(Uuid),
    #[error("article not found: {0}")]
    ArticleNotFound(Uuid),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

// ─── Registry ────────────────────────────────────────────────────────────────

struct PlanetEntry {
    planet: Planet,
    articles: HashMap<Uuid, Article>,
    history: Vec<PublishRecord>,
}

pub struct Registry {
    data_dir: PathBuf,
    broadcaster: Arc<EventBroadcaster>,
    inner: RwLock<HashMap<Uuid, PlanetEntry>>,
}

impl Registry {
    /// Load all planets from disk. A corrupt planet directory is skipped with
    /// an error log rather than failing the whole daemon.
    pub fn load(data_dir: &Path, broadcaster: Arc<EventBroadcaster>) -> Result<Self, RegistryError> {
        let my_dir = data_dir.join("My");
        fs::create_dir_all(&my_dir)?;

        let mut entries = HashMap::new();
        for dir in fs::read_dir(&my_dir)? {
            let path = dir?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()).and_then(|n| Uuid::parse_str(n).ok())
            else {
                continue;
            };
            match load_planet_entry(&path) {
                Ok(entry) => {
                    entries.insert(id, entry);
                }
                Err(e) => error!(planet_id = %id, err = %e, "failed to load planet — skipping"),
            }
        }
        info!(count = entries.len(), "registry loaded");

        Ok(Self { data_dir: data_dir.to_path_buf(), broadcaster, inner: RwLock::new(entries) })
    }

    fn planet_dir(&self, id: Uuid) -> PathBuf {
        self.data_dir.join("My").join(id.to_string())
    }

    // ─── Planets ─────────────────────────────────────────────────────────────

    pub async fn planets(&self) -> Vec<Planet> {
        let inner = self.inner.read().await;
        let mut planets: Vec<Planet> = inner.values().map(|e| e.planet.clone()).collect();
        planets.sort_by(|a, b| b.updated.cmp(&a.updated));
        planets
    }

    pub async fn get_planet(&self, id: Uuid) -> Result<Planet, RegistryError> {
        let inner = self.inner.read().await;
        inner
            .get(&id)
            .map(|e| e.planet.clone())
            .ok_or(RegistryError::PlanetNotFound(id))
    }

    pub async fn create_planet(
        &self,
        name: &str,
        about: &str,
        template: &str,
    ) -> Result<Planet, RegistryError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let planet = Planet {
            id,
            name: name.to_string(),
            about: about.to_string(),
            template: template.to_string(),
            naming_key_ref: format!("planet-{id}"),
            created: now,
            updated: now,
            last_published_root: None,
            last_published_at: None,
            observed_sequence: 0,
        };

        let dir = self.planet_dir(id);
        fs::create_dir_all(dir.join("Articles"))?;
        save_planet(&dir, &planet)?;

        let mut inner = self.inner.write().await;
        inner.insert(id, PlanetEntry { planet: planet.clone(), articles: HashMap::new(), history: Vec::new() });
        drop(inner);

        info!(planet_id = %id, name = %planet.name, "planet created");
        self.broadcast_snapshot().await;
        Ok(planet)
    }

    /// Edit a planet's metadata in place. The naming key and publish
    /// bookkeeping are not editable through this path.
    pub async fn update_planet<F>(&self, id: Uuid, f: F) -> Result<Planet, RegistryError>
    where
        F: FnOnce(&mut Planet),
    {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&id).ok_or(RegistryError::PlanetNotFound(id))?;
        let key_ref = entry.planet.naming_key_ref.clone();
        f(&mut entry.planet);
        entry.planet.naming_key_ref = key_ref;
        entry.planet.updated = Utc::now();
        let updated = entry.planet.clone();
        save_planet(&self.planet_dir(id), &updated)?;
        drop(inner);

        info!(planet_id = %id, name = %updated.name, "planet updated");
        self.broadcast_snapshot().await;
        Ok(updated)
    }

    /// Remove the planet and everything under it. Returns the removed record
    /// and its published roots (newest last) so the caller can release pins
    /// and the naming key.
    pub async fn delete_planet(&self, id: Uuid) -> Result<(Planet, Vec<ContentId>), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.remove(&id).ok_or(RegistryError::PlanetNotFound(id))?;
        drop(inner);

        let dir = self.planet_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(planet_id = %id, name = %entry.planet.name, "planet deleted");
        self.broadcast_snapshot().await;

        let roots = entry.history.iter().map(|r| r.root_content_id.clone()).collect();
        Ok((entry.planet, roots))
    }

    // ─── Articles ────────────────────────────────────────────────────────────

    pub async fn create_article(
        &self,
        planet_id: Uuid,
        title: &str,
        content: &str,
    ) -> Result<Article, RegistryError> {
        let now = Utc::now();
        let article = Article {
            id: Uuid::new_v4(),
            planet_id,
            title: title.to_string(),
            content: content.to_string(),
            attachments: Vec::new(),
            tags: BTreeSet::new(),
            created: now,
            updated: now,
        };

        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        save_article(&self.planet_dir(planet_id), &article)?;
        entry.articles.insert(article.id, article.clone());
        entry.planet.updated = now;
        save_planet(&self.planet_dir(planet_id), &entry.planet)?;
        drop(inner);

        info!(planet_id = %planet_id, article_id = %article.id, "article created");
        self.broadcast_snapshot().await;
        Ok(article)
    }

    pub async fn update_article<F>(
        &self,
        planet_id: Uuid,
        article_id: Uuid,
        f: F,
    ) -> Result<Article, RegistryError>
    where
        F: FnOnce(&mut Article),
    {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        let article = entry
            .articles
            .get_mut(&article_id)
            .ok_or(RegistryError::ArticleNotFound(article_id))?;
        f(article);
        article.updated = Utc::now();
        entry.planet.updated = article.updated;
        let updated = article.clone();
        save_article(&self.planet_dir(planet_id), &updated)?;
        save_planet(&self.planet_dir(planet_id), &entry.planet)?;
        drop(inner);

        self.broadcast_snapshot().await;
        Ok(updated)
    }

    pub async fn delete_article(&self, planet_id: Uuid, article_id: Uuid) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        if entry.articles.remove(&article_id).is_none() {
            return Err(RegistryError::ArticleNotFound(article_id));
        }
        entry.planet.updated = Utc::now();
        let path = self.planet_dir(planet_id).join("Articles").join(format!("{article_id}.json"));
        if path.exists() {
            fs::remove_file(&path)?;
        }
        save_planet(&self.planet_dir(planet_id), &entry.planet)?;
        drop(inner);

        info!(planet_id = %planet_id, article_id = %article_id, "article deleted");
        self.broadcast_snapshot().await;
        Ok(())
    }

    /// Copy-on-read snapshot of a planet's articles, newest first. Edits made
    /// after the snapshot land in the next publish, not the in-flight one.
    pub async fn articles(&self, planet_id: Uuid) -> Result<Vec<Article>, RegistryError> {
        let inner = self.inner.read().await;
        let entry = inner.get(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        let mut articles: Vec<Article> = entry.articles.values().cloned().collect();
        articles.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(articles)
    }

    // ─── Publish bookkeeping ─────────────────────────────────────────────────

    /// Sequence number the next publish must carry: one past the highest
    /// sequence known — our own history or a foreign record we ran into.
    pub async fn next_sequence(&self, planet_id: Uuid) -> Result<u64, RegistryError> {
        let inner = self.inner.read().await;
        let entry = inner.get(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        let published = entry.history.last().map_or(0, |r| r.naming_sequence_number);
        Ok(published.max(entry.planet.observed_sequence) + 1)
    }

    /// Record a naming-record sequence observed at the node. A conflict told
    /// us the record is ahead of our history; remembering its position makes
    /// the next publish attempt submit a sequence the record will accept.
    pub async fn observe_sequence(&self, planet_id: Uuid, current: u64) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        if current > entry.planet.observed_sequence {
            entry.planet.observed_sequence = current;
            save_planet(&self.planet_dir(planet_id), &entry.planet)?;
        }
        Ok(())
    }

    pub async fn history(&self, planet_id: Uuid) -> Result<Vec<PublishRecord>, RegistryError> {
        let inner = self.inner.read().await;
        let entry = inner.get(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;
        Ok(entry.history.clone())
    }

    /// Append a successful publish and advance `last_published_*`. Returns all
    /// published roots oldest-first so the caller can trim the pin window.
    pub async fn record_publish(
        &self,
        planet_id: Uuid,
        record: PublishRecord,
    ) -> Result<Vec<ContentId>, RegistryError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(&planet_id).ok_or(RegistryError::PlanetNotFound(planet_id))?;

        debug_assert!(
            entry.history.last().map_or(0, |r| r.naming_sequence_number)
                < record.naming_sequence_number
        );
        entry.planet.last_published_root = Some(record.root_content_id.clone());
        entry.planet.last_published_at = Some(record.published_at);
        entry.history.push(record);

        let dir = self.planet_dir(planet_id);
        save_planet(&dir, &entry.planet)?;
        save_history(&dir, &entry.history)?;
        let roots = entry.history.iter().map(|r| r.root_content_id.clone()).collect();
        drop(inner);

        self.broadcast_snapshot().await;
        Ok(roots)
    }

    async fn broadcast_snapshot(&self) {
        let planets = self.planets().await;
        self.broadcaster.planets_changed(planets);
    }
}

// ─── Disk mirror ─────────────────────────────────────────────────────────────

fn save_planet(dir: &Path, planet: &Planet) -> Result<(), RegistryError> {
    fs::write(dir.join("planet.json"), serde_json::to_string_pretty(planet)?)?;
    debug!(planet_id = %planet.id, "planet saved");
    Ok(())
}

fn save_article(dir: &Path, article: &Article) -> Result<(), RegistryError> {
    let path = dir.join("Articles").join(format!("{}.json", article.id));
    fs::write(path, serde_json::to_string_pretty(article)?)?;
    Ok(())
}

fn save_history(dir: &Path, history: &[PublishRecord]) -> Result<(), RegistryError> {
    fs::write(dir.join("history.json"), serde_json::to_string_pretty(history)?)?;
    Ok(())
}

fn load_planet_entry(dir: &Path) -> Result<PlanetEntry, RegistryError> {
    let planet: Planet = serde_json::from_str(&fs::read_to_string(dir.join("planet.json"))?)?;

    let mut articles = HashMap::new();
    let articles_dir = dir.join("Articles");
    if articles_dir.exists() {
        for entry in fs::read_dir(&articles_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match serde_json::from_str::<Article>(&fs::read_to_string(&path)?) {
                Ok(article) if article.planet_id == planet.id => {
                    articles.insert(article.id, article);
                }
                Ok(article) => {
                    error!(article_id = %article.id, "article belongs to another planet — skipping")
                }
                Err(e) => error!(path = %path.display(), err = %e, "corrupt article — skipping"),
            }
        }
    }

    let history_path = dir.join("history.json");
    let history = if history_path.exists() {
        serde_json::from_str(&fs::read_to_string(&history_path)?)?
    } else {
        Vec::new()
    };

    Ok(PlanetEntry { planet, articles, history })
}
