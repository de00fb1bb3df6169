//! HTTP client for the node's local control API.
//!
//! Thin wrapper over `POST http://127.0.0.1:<api_port>/api/v0/<path>` with
//! query-string arguments, the way the node's own CLI talks to it. Response
//! shapes mirror the node's JSON (capitalized field names).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::process::SharedPorts;
use super::{ApiError, ContentId, NodeApi, NodeStatus, RepoStat};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Pin/unpin/GC walk the whole object graph and can take a while.
const SLOW_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Wire shapes ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Debug, Deserialize)]
struct PeersResponse {
    #[serde(rename = "Peers")]
    peers: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    #[serde(rename = "Name")]
    #[allow(dead_code)]
    name: String,
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    #[serde(rename = "Path")]
    path: String,
}

#[derive(Debug, Deserialize)]
struct RepoStatResponse {
    #[serde(rename = "RepoSize")]
    repo_size: u64,
    #[serde(rename = "NumObjects")]
    num_objects: u64,
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct HttpNodeApi {
    client: Client,
    slow_client: Client,
    ports: SharedPorts,
}

impl HttpNodeApi {
    /// `ports` comes from [`super::process::NodeProcess::ports_handle`] so the
    /// client always dials whatever port the running process was given.
    pub fn new(ports: SharedPorts) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("reqwest client");
        let slow_client = Client::builder()
            .timeout(SLOW_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client, slow_client, ports }
    }

    fn api_port(&self) -> Result<u16, ApiError> {
        self.ports
            .read()
            .expect("ports lock poisoned")
            .map(|p| p.api)
            .ok_or(ApiError::Offline)
    }

    fn url(&self, path: &str, args: &HashMap<&str, String>) -> Result<String, ApiError> {
        let mut url = format!("http://127.0.0.1:{}/api/v0/{}", self.api_port()?, path);
        if !args.is_empty() {
            let query: Vec<String> = args.iter().map(|(k, v)| format!("{k}={v}")).collect();
            url = format!("{}?{}", url, query.join("&"));
        }
        Ok(url)
    }

    async fn call(
        &self,
        path: &str,
        args: &HashMap<&str, String>,
        slow: bool,
    ) -> Result<Vec<u8>, ApiError> {
        let url = self.url(path, args)?;
        let client = if slow { &self.slow_client } else { &self.client };
        let response = client.post(&url).send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(path, status = status.as_u16(), "control API error");
            if status.as_u16() == 409 {
                // The node rejected a stale naming sequence.
                return Err(parse_conflict(&body));
            }
            if status.as_u16() == 404 || body.contains("not found") {
                return Err(ApiError::NotFound(ContentId(
                    args.get("arg").cloned().unwrap_or_default(),
                )));
            }
            return Err(ApiError::Status { status: status.as_u16(), body });
        }
        Ok(response.bytes().await.map_err(map_reqwest)?.to_vec())
    }

    async fn call_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        args: &HashMap<&str, String>,
    ) -> Result<T, ApiError> {
        let data = self.call(path, args, false).await?;
        serde_json::from_slice(&data)
            .map_err(|e| ApiError::Transport(format!("decode {path} response: {e}")))
    }
}

fn map_reqwest(e: reqwest::Error) -> ApiError {
    if e.is_connect() {
        ApiError::Offline
    } else {
        ApiError::Transport(e.to_string())
    }
}

fn parse_conflict(body: &str) -> ApiError {
    #[derive(Deserialize)]
    struct Conflict {
        submitted: u64,
        current: u64,
    }
    match serde_json::from_str::<Conflict>(body) {
        Ok(c) => ApiError::SequenceConflict { submitted: c.submitted, current: c.current },
        Err(_) => ApiError::SequenceConflict { submitted: 0, current: 0 },
    }
}

fn no_args() -> HashMap<&'static str, String> {
    HashMap::new()
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    async fn status(&self) -> Result<NodeStatus, ApiError> {
        let id: IdResponse = self.call_json("id", &no_args()).await?;
        let version: VersionResponse = self.call_json("version", &no_args()).await?;
        let peers: PeersResponse = self.call_json("swarm/peers", &no_args()).await?;
        Ok(NodeStatus {
            peer_id: id.id,
            node_version: version.version,
            peer_count: peers.peers.map_or(0, |p| p.len()),
        })
    }

    async fn add(&self, bytes: Vec<u8>) -> Result<ContentId, ApiError> {
        let url = self.url("add", &HashMap::from([("pin", "false".to_string())]))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name("blob");
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let added: AddResponse = response.json().await.map_err(map_reqwest)?;
        Ok(ContentId(added.hash))
    }

    async fn cat(&self, id: &ContentId) -> Result<Vec<u8>, ApiError> {
        let args = HashMap::from([("arg", id.0.clone())]);
        self.call("cat", &args, false).await
    }

    async fn pin(&self, id: &ContentId) -> Result<(), ApiError> {
        let args = HashMap::from([("arg", id.0.clone())]);
        self.call("pin/add", &args, true).await?;
        Ok(())
    }

    async fn unpin(&self, id: &ContentId) -> Result<(), ApiError> {
        let args = HashMap::from([("arg", id.0.clone())]);
        match self.call("pin/rm", &args, true).await {
            Ok(_) => Ok(()),
            // Unpinning something that was never pinned is a no-op success.
            Err(ApiError::Status { body, .. }) if body.contains("not pinned") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn key_gen(&self, name: &str) -> Result<String, ApiError> {
        let args = HashMap::from([("arg", name.to_string()), ("type", "ed25519".to_string())]);
        match self.call_json::<KeyResponse>("key/gen", &args).await {
            Ok(key) => Ok(key.id),
            Err(ApiError::Status { body, .. }) if body.contains("already exists") => {
                // Idempotent: look the existing key up instead.
                #[derive(Deserialize)]
                struct KeyList {
                    #[serde(rename = "Keys")]
                    keys: Vec<KeyResponse>,
                }
                let list: KeyList = self.call_json("key/list", &no_args()).await?;
                list.keys
                    .into_iter()
                    .find(|k| k.name == name)
                    .map(|k| k.id)
                    .ok_or_else(|| ApiError::KeyNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn key_rm(&self, name: &str) -> Result<(), ApiError> {
        let args = HashMap::from([("arg", name.to_string())]);
        match self.call("key/rm", &args, false).await {
            Ok(_) => Ok(()),
            Err(ApiError::Status { body, .. }) if body.contains("no key named") => {
                Err(ApiError::KeyNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn name_resolve(&self, key: &str) -> Result<ContentId, ApiError> {
        let args = HashMap::from([("arg", key.to_string())]);
        let resolved: ResolveResponse = self.call_json("name/resolve", &args).await?;
        match resolved.path.strip_prefix("/ipfs/") {
            Some(cid) => Ok(ContentId(cid.to_string())),
            None => Err(ApiError::Transport(format!("unexpected resolve path: {}", resolved.path))),
        }
    }

    async fn name_publish(&self, key: &str, root: &ContentId, seq: u64) -> Result<(), ApiError> {
        let args = HashMap::from([
            ("arg", format!("/ipfs/{}", root)),
            ("key", key.to_string()),
            ("seq", seq.to_string()),
        ]);
        self.call("name/publish", &args, true).await?;
        Ok(())
    }

    async fn repo_gc(&self) -> Result<usize, ApiError> {
        let data = self.call("repo/gc", &no_args(), true).await?;
        // The node streams one JSON object per reclaimed key.
        let count = String::from_utf8_lossy(&data)
            .lines()
            .filter(|l| l.contains("Key"))
            .count();
        Ok(count)
    }

    async fn repo_stat(&self) -> Result<RepoStat, ApiError> {
        let stat: RepoStatResponse = self.call_json("repo/stat", &no_args()).await?;
        Ok(RepoStat { repo_size_bytes: stat.repo_size, num_objects: stat.num_objects })
    }

    async fn shutdown(&self) -> Result<(), ApiError> {
        match self.call("shutdown", &no_args(), false).await {
            Ok(_) => Ok(()),
            // The node may drop the connection while going down, or already
            // be gone. Either way the goal is reached.
            Err(ApiError::Offline) | Err(ApiError::Transport(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
