//! Docker Remote API client.
//!
//! Serves two needs of the reload pipeline: the one-shot container
//! inventory (`GET /containers/json` plus one inspect per container) and
//! the newline-delimited JSON event stream (`GET /events`).
//!
//! The endpoint is either a plain HTTP URL (`http://172.17.42.1:4243`)
//! or a unix-socket form (`unix:///var/run/docker.sock:`), where the
//! part after the scheme splits on the first `:` into the socket path
//! and the HTTP path prefix the API paths are appended to.
use std::collections::HashMap;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::{
    Request, Response, body::{Bytes, Incoming}, header,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::{net::UnixStream, sync::mpsc};

use crate::{
    core::route::Container,
    ports::container_runtime::{ContainerRuntime, RuntimeError, RuntimeEvent, RuntimeResult},
};

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Clone)]
pub struct DockerClient {
    endpoint: String,
    client: Client<HttpConnector, Empty<Bytes>>,
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerDetail {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Split a `unix://<socket>:<http-path>` endpoint-plus-path string into
/// its socket path and request path. The separator is the *first* `:`
/// after the scheme; the query string stays attached to the path.
fn split_unix(s: &str) -> RuntimeResult<(&str, &str)> {
    let rest = s
        .strip_prefix("unix://")
        .ok_or_else(|| RuntimeError::Endpoint(format!("not a unix endpoint: {s}")))?;
    rest.split_once(':')
        .ok_or_else(|| RuntimeError::Endpoint(format!("missing ':' separator: {s}")))
}

impl DockerClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    /// Issue a GET against the runtime API, dispatching on the endpoint
    /// scheme. Both branches hand back the same streaming response.
    async fn get(&self, api_path: &str) -> RuntimeResult<Response<Incoming>> {
        let full = format!("{}{}", self.endpoint, api_path);

        if full.starts_with("unix:") {
            let (socket, path) = split_unix(&full)?;

            let stream = UnixStream::connect(socket)
                .await
                .map_err(|e| RuntimeError::Transport(format!("dial {socket}: {e}")))?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "runtime socket connection closed");
                }
            });

            let request = Request::builder()
                .uri(path)
                .header(header::HOST, "localhost")
                .body(Empty::<Bytes>::new())
                .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
            sender
                .send_request(request)
                .await
                .map_err(|e| RuntimeError::Transport(e.to_string()))
        } else {
            let uri = full
                .parse::<hyper::Uri>()
                .map_err(|e| RuntimeError::Endpoint(format!("{full}: {e}")))?;
            self.client
                .get(uri)
                .await
                .map_err(|e| RuntimeError::Transport(e.to_string()))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, api_path: &str) -> RuntimeResult<T> {
        let response = self.get(api_path).await?;
        if !response.status().is_success() {
            return Err(RuntimeError::Protocol(format!(
                "GET {api_path}: status {}",
                response.status()
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&body).map_err(|e| RuntimeError::Protocol(e.to_string()))
    }

    /// One reconnect cycle of the event stream: read NDJSON objects and
    /// forward them until the stream ends or a line fails to decode.
    /// Returns false once the receiving side is gone.
    async fn pump_events(&self, tx: &mpsc::Sender<RuntimeEvent>) -> RuntimeResult<bool> {
        let response = self.get("/events").await?;
        if !response.status().is_success() {
            return Err(RuntimeError::Protocol(format!(
                "GET /events: status {}",
                response.status()
            )));
        }

        let mut body = response.into_body();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| RuntimeError::Transport(e.to_string()))?;
            let Some(data) = frame.data_ref() else {
                continue;
            };
            buffer.extend_from_slice(data);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let event: RuntimeEvent = serde_json::from_str(line)
                    .map_err(|e| RuntimeError::Protocol(format!("event decode: {e}")))?;
                if tx.send(event).await.is_err() {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    async fn event_loop(self, tx: mpsc::Sender<RuntimeEvent>) {
        loop {
            match self.pump_events(&tx).await {
                Ok(true) => {
                    tracing::warn!("runtime event stream ended, reconnecting");
                }
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "runtime event stream failed, reconnecting");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn containers(&self) -> RuntimeResult<HashMap<String, Container>> {
        let summaries: Vec<ContainerSummary> = self.get_json("/containers/json").await?;

        let mut containers = HashMap::new();
        for summary in summaries {
            let detail: ContainerDetail = self
                .get_json(&format!("/containers/{}/json", summary.id))
                .await?;

            let container = Container {
                name: detail.name.trim_start_matches('/').to_string(),
                ip: detail.network_settings.ip_address,
            };

            // Register the canonical name and every alias the runtime
            // reported; all point at the same container.
            containers.insert(container.name.clone(), container.clone());
            for alias in summary.names {
                containers.insert(alias, container.clone());
            }
        }

        Ok(containers)
    }

    fn watch(&self) -> mpsc::Receiver<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(self.clone().event_loop(tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn unix_endpoint_splits_on_first_colon() {
        let (socket, path) = split_unix("unix:///var/run/docker.sock:/containers/json").unwrap();
        assert_eq!(socket, "/var/run/docker.sock");
        assert_eq!(path, "/containers/json");

        let (socket, path) = split_unix("unix:///a/b.sock:/events?since=1").unwrap();
        assert_eq!(socket, "/a/b.sock");
        assert_eq!(path, "/events?since=1");
    }

    #[test]
    fn unix_endpoint_without_separator_is_rejected() {
        assert!(split_unix("unix:///var/run/docker.sock").is_err());
        assert!(split_unix("http://example.com").is_err());
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn inventory_registers_every_alias() {
        let app = Router::new()
            .route(
                "/containers/json",
                get(|| async {
                    Json(json!([
                        {"Id": "abc123", "Names": ["/db", "/web/db-link"]}
                    ]))
                }),
            )
            .route(
                "/containers/abc123/json",
                get(|| async {
                    Json(json!({
                        "Name": "/db",
                        "NetworkSettings": {"IPAddress": "172.17.0.9"}
                    }))
                }),
            );
        let endpoint = serve(app).await;

        let client = DockerClient::new(&endpoint);
        let containers = client.containers().await.unwrap();

        // Canonical name (slash stripped) plus both raw aliases.
        assert_eq!(containers["db"].ip, "172.17.0.9");
        assert_eq!(containers["/db"].ip, "172.17.0.9");
        assert_eq!(containers["/web/db-link"].ip, "172.17.0.9");
        assert_eq!(containers.len(), 3);
    }

    #[tokio::test]
    async fn event_stream_decodes_ndjson() {
        let app = Router::new().route(
            "/events",
            get(|| async {
                concat!(
                    "{\"status\":\"start\",\"id\":\"abc\",\"from\":\"img\",\"time\":1}\n",
                    "{\"status\":\"die\",\"id\":\"def\",\"from\":\"img\",\"time\":2}\n",
                )
            }),
        );
        let endpoint = serve(app).await;

        let client = DockerClient::new(&endpoint);
        let mut rx = client.watch();

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.status, "start");
        assert_eq!(first.id, "abc");

        let second = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.status, "die");
    }
}
