//! etcd v2 keys API client.
//!
//! The routing tree lives below a configurable root key
//! (`<root>/<account>/<destination>/<priority>.<rule-name>` with the
//! pattern as the leaf value). Reads go through the recursive form of
//! `GET /v2/keys`; change notifications come from the API's long-poll
//! watch (`?wait=true&recursive=true`). A missing root key is reported
//! by etcd as `errorCode` 100 and treated as an empty configuration.
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    core::table::{AccountNode, DestinationNode, RouteTree, RuleLeaf},
    ports::route_store::{RouteStore, StoreError, StoreResult},
};

/// etcd error code for "key not found".
const CODE_KEY_NOT_FOUND: u64 = 100;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct EtcdClient {
    /// `GET {keys_url}?recursive=true` is the full tree read.
    keys_url: String,
    fetch_client: reqwest::Client,
    /// Separate client without a timeout; watch requests block until the
    /// next change.
    watch_client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: EtcdNode,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EtcdNode {
    key: String,
    value: Option<String>,
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdError {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
}

/// Shape shared by watch events and watch error payloads.
#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(default)]
    node: Option<WatchNode>,
    #[serde(rename = "errorCode")]
    error_code: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WatchNode {
    #[serde(rename = "modifiedIndex")]
    modified_index: Option<u64>,
}

impl EtcdClient {
    /// `endpoint` is the store base URL (e.g. `http://172.17.42.1:4001`),
    /// `root` the key the routing tree hangs below (e.g. `/proxy`).
    pub fn new(endpoint: &str, root: &str) -> StoreResult<Self> {
        let endpoint = endpoint.trim_end_matches('/');
        let root = if root.starts_with('/') {
            root.to_string()
        } else {
            format!("/{root}")
        };

        let fetch_client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let watch_client = reqwest::Client::new();

        Ok(Self {
            keys_url: format!("{endpoint}/v2/keys{root}"),
            fetch_client,
            watch_client,
        })
    }

    fn last_segment(key: &str) -> &str {
        key.rsplit('/').next().unwrap_or(key)
    }

    /// Map the store's node tree onto the three fixed levels the builder
    /// understands. Depth beyond the leaf level and value-less leaves
    /// are ignored.
    fn into_tree(root: EtcdNode) -> RouteTree {
        let accounts = root
            .nodes
            .into_iter()
            .map(|account| AccountNode {
                name: Self::last_segment(&account.key).to_string(),
                destinations: account
                    .nodes
                    .into_iter()
                    .map(|destination| DestinationNode {
                        key: Self::last_segment(&destination.key).to_string(),
                        rules: destination
                            .nodes
                            .into_iter()
                            .filter_map(|leaf| {
                                let key = Self::last_segment(&leaf.key).to_string();
                                leaf.value.map(|pattern| RuleLeaf { key, pattern })
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        RouteTree { accounts }
    }

    async fn watch_loop(client: reqwest::Client, keys_url: String, tx: mpsc::Sender<()>) {
        let mut wait_index: Option<u64> = None;

        loop {
            let mut url = format!("{keys_url}?wait=true&recursive=true");
            if let Some(index) = wait_index {
                url.push_str(&format!("&waitIndex={index}"));
            }

            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "config watch request failed, reconnecting");
                    wait_index = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            match response.json::<WatchResponse>().await {
                Ok(watch) => {
                    if let Some(code) = watch.error_code {
                        // Typically 401 EventIndexCleared: the store
                        // compacted past our index. Start over from now;
                        // the triggered rebuild re-reads everything
                        // anyway.
                        tracing::warn!(code, "config watch index invalid, resetting");
                        wait_index = None;
                    } else {
                        wait_index = watch
                            .node
                            .and_then(|n| n.modified_index)
                            .map(|index| index + 1);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "config watch returned malformed event");
                    wait_index = None;
                }
            }

            if tx.send(()).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl RouteStore for EtcdClient {
    async fn fetch_tree(&self) -> StoreResult<Option<RouteTree>> {
        let url = format!("{}?recursive=true", self.keys_url);
        let response = self
            .fetch_client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if response.status().is_success() {
            let keys = response
                .json::<KeysResponse>()
                .await
                .map_err(|e| StoreError::Protocol(e.to_string()))?;
            return Ok(Some(Self::into_tree(keys.node)));
        }

        let status = response.status();
        match response.json::<EtcdError>().await {
            Ok(error) if error.error_code == CODE_KEY_NOT_FOUND => Ok(None),
            Ok(error) => Err(StoreError::Protocol(format!(
                "etcd error {}: {}",
                error.error_code, error.message
            ))),
            Err(_) => Err(StoreError::Protocol(format!(
                "unexpected status {status}"
            ))),
        }
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(Self::watch_loop(
            self.watch_client.clone(),
            self.keys_url.clone(),
            tx,
        ));
        rx
    }
}
