//! HTTP reverse proxy.
//!
//! Bound to a single fixed account. The requested Host (header, or URI
//! authority for the odd absolute-form request) is run through the
//! account's routes; the request is then replayed against the rewritten
//! host and the response streamed back. With no matching route and no
//! Host to speak of there is nowhere to go, which is a 502.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
};
use eyre::{Result, WrapErr};
use hyper::{StatusCode, header::HeaderValue};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;

use crate::core::registry::Registry;

pub struct RevHttpProxy {
    registry: Arc<Registry>,
    account_name: String,
    client: Client<HttpConnector, Body>,
}

impl RevHttpProxy {
    pub fn new(registry: Arc<Registry>, account_name: impl Into<String>) -> Self {
        Self {
            registry,
            account_name: account_name.into(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let make_route = |proxy: Arc<Self>| {
            any(
                move |ConnectInfo(remote): ConnectInfo<SocketAddr>, req: Request| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(req, remote).await }
                },
            )
        };

        let app = Router::new()
            .route("/", make_route(self.clone()))
            .route("/{*path}", make_route(self.clone()));

        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("reverse proxy bind {addr}"))?;
        tracing::info!(addr, account = %self.account_name, "reverse proxy listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .wrap_err("reverse proxy server error")
    }

    async fn handle(self: Arc<Self>, mut req: Request, remote: SocketAddr) -> Response {
        let Some(account) = self.registry.get(&self.account_name) else {
            tracing::warn!(account = %self.account_name, "reverse proxy account not found");
            return status_response(StatusCode::BAD_GATEWAY);
        };

        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let target = account.routes.replace(&host);
        if target.is_empty() {
            tracing::debug!(account = %account.name, "no host and no catch-all route");
            return status_response(StatusCode::BAD_GATEWAY);
        }
        tracing::debug!(account = %account.name, %host, %target, "reverse proxying");

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: hyper::Uri = match format!("http://{target}{path_and_query}").parse() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(%target, error = %e, "rewritten host is not a valid authority");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };
        *req.uri_mut() = uri;

        let remote_value =
            HeaderValue::from_str(&remote.to_string()).expect("socket address is ascii");
        req.headers_mut().append("x-real-ip", remote_value);

        match self.client.request(req).await {
            Ok(response) => response.map(Body::new),
            Err(e) => {
                tracing::debug!(error = %e, "backend request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}
