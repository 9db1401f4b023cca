// # etcd Key-Value Store
//
// This crate provides the `KvStore` implementation over the etcd v2 HTTP
// keys API.
//
// ## Requests
//
// - Read: `GET /v2/keys{path}?recursive=true`
// - Watch: `GET /v2/keys{prefix}?wait=true&recursive=true&waitIndex=N`
//
// A watch is a long poll that returns exactly one event. The stream issues
// the next poll with `waitIndex = modifiedIndex + 1`, so no event between
// two polls is lost. When the requested index has already been purged from
// etcd's event history, the watch resumes from the current index.
//
// ## Endpoints
//
// Endpoints are tried in order for every request; the first one that
// answers wins. Only transport failures move on to the next endpoint.

mod wire;

use hostdns_core::config::StoreConfig;
use hostdns_core::traits::{KvStore, KvTree, WatchStream};
use hostdns_core::{Error, Result};

use futures_util::stream;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use wire::{ErrorBody, KeysResponse};

/// Header carrying the store index a response was served at
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

/// Timeout for establishing a connection, used for watches too
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// etcd v2 store client
pub struct EtcdKvStore {
    /// Endpoint base URLs, without trailing slash
    endpoints: Arc<[String]>,

    /// Client for reads (bounded request time)
    client: reqwest::Client,

    /// Client for long-poll watches (connect timeout only)
    watch_client: reqwest::Client,
}

impl EtcdKvStore {
    /// Create a store client from the store configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            config.endpoints.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Create a store client
    ///
    /// # Parameters
    ///
    /// - `endpoints`: Base URLs such as `http://127.0.0.1:2379`, tried in order
    /// - `request_timeout`: Upper bound for non-watch requests
    pub fn new(endpoints: Vec<String>, request_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::config("At least one etcd endpoint is required"));
        }

        let endpoints: Arc<[String]> = endpoints
            .into_iter()
            .map(|endpoint| endpoint.trim_end_matches('/').to_string())
            .collect();

        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        let watch_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoints,
            client,
            watch_client,
        })
    }

    /// Configured endpoints, in the order they are tried
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait::async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, path: &str) -> Result<KvTree> {
        let reply = send(
            &self.client,
            &self.endpoints,
            path,
            &[("recursive", "true".to_string())],
        )
        .await?;

        if !reply.status.is_success() {
            return Err(reply.into_error(path));
        }

        let response: KeysResponse = serde_json::from_str(&reply.body)?;
        let tree = response.node.into_tree(reply.etcd_index.unwrap_or(0));
        debug!("Read {} node(s) under {} at index {}", tree.len(), path, tree.index());
        Ok(tree)
    }

    fn watch(&self, prefix: &str, after_index: Option<u64>) -> WatchStream {
        let state = WatchState {
            client: self.watch_client.clone(),
            endpoints: Arc::clone(&self.endpoints),
            prefix: prefix.to_string(),
            wait_index: after_index.map(|index| index + 1),
            failed: false,
        };

        Box::pin(stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }

            loop {
                match state.poll().await {
                    Ok(WatchPoll::Change(event, next_index)) => {
                        state.wait_index = Some(next_index);
                        return Some((Ok(event), state));
                    }
                    Ok(WatchPoll::Resume(index)) => {
                        warn!(
                            "Watch index on {} was cleared, resuming at {}",
                            state.prefix, index
                        );
                        state.wait_index = Some(index);
                    }
                    Ok(WatchPoll::Empty) => {
                        debug!("Watch on {} returned no event, polling again", state.prefix);
                    }
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        }))
    }

    fn store_name(&self) -> &'static str {
        "etcd"
    }
}

/// State threaded through the watch stream
struct WatchState {
    client: reqwest::Client,
    endpoints: Arc<[String]>,
    prefix: String,
    wait_index: Option<u64>,
    failed: bool,
}

/// Outcome of one long poll
enum WatchPoll {
    /// An event and the index to wait for next
    Change(hostdns_core::traits::ChangeEvent, u64),
    /// The wait index was purged; continue from this one
    Resume(u64),
    /// The server closed the poll without an event
    Empty,
}

impl WatchState {
    async fn poll(&self) -> Result<WatchPoll> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
        ];
        if let Some(index) = self.wait_index {
            query.push(("waitIndex", index.to_string()));
        }

        let reply = send(&self.client, &self.endpoints, &self.prefix, &query).await?;

        if !reply.status.is_success() {
            if let Some(body) = reply.error_body() {
                if body.error_code == wire::EVENT_INDEX_CLEARED {
                    let current = reply.etcd_index.unwrap_or(body.index);
                    return Ok(WatchPoll::Resume(current + 1));
                }
            }
            return Err(Error::watch(reply.into_error(&self.prefix).to_string()));
        }

        if reply.body.trim().is_empty() {
            return Ok(WatchPoll::Empty);
        }

        let response: KeysResponse = serde_json::from_str(&reply.body)?;
        let (event, next_index) = response.into_change();
        Ok(WatchPoll::Change(event, next_index))
    }
}

/// Raw answer from one endpoint
struct Reply {
    status: StatusCode,
    etcd_index: Option<u64>,
    body: String,
}

impl Reply {
    fn error_body(&self) -> Option<ErrorBody> {
        serde_json::from_str(&self.body).ok()
    }

    fn into_error(self, path: &str) -> Error {
        match self.error_body() {
            Some(body) if body.error_code == wire::KEY_NOT_FOUND => {
                Error::not_found(format!("Key not found: {}", path))
            }
            Some(body) => Error::store(format!(
                "etcd error {} on {}: {} ({})",
                body.error_code, path, body.message, body.cause
            )),
            None => Error::http(format!("etcd returned {} for {}", self.status, path)),
        }
    }
}

/// Build the keys API URL for `path` on `endpoint`
fn keys_url(endpoint: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}/v2/keys{}", endpoint, path)
    } else {
        format!("{}/v2/keys/{}", endpoint, path)
    }
}

/// Send a GET to the first endpoint that answers
async fn send(
    client: &reqwest::Client,
    endpoints: &[String],
    path: &str,
    query: &[(&str, String)],
) -> Result<Reply> {
    let mut last_error = None;

    for endpoint in endpoints {
        let url = keys_url(endpoint, path);
        match client.get(&url).query(query).send().await {
            Ok(response) => {
                let status = response.status();
                let etcd_index = response
                    .headers()
                    .get(ETCD_INDEX_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok());
                let body = response.text().await.map_err(|e| {
                    Error::http(format!("Failed to read response from {}: {}", endpoint, e))
                })?;

                return Ok(Reply {
                    status,
                    etcd_index,
                    body,
                });
            }
            Err(e) => {
                warn!("etcd endpoint {} failed: {}", endpoint, e);
                last_error = Some(e.to_string());
            }
        }
    }

    Err(Error::store(format!(
        "No etcd endpoint reachable (last error: {})",
        last_error.unwrap_or_default()
    )))
}
