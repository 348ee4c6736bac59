//! HTTP forward proxy.
//!
//! Speaks both proxy forms of HTTP/1.1: `CONNECT host:port` (tunneled
//! with a bidirectional copy after the 200) and absolute-form requests
//! (forwarded upstream after the host rewrite). Callers authenticate
//! with `Proxy-Authorization: Basic user:password`, where the user names
//! the account; a fixed account configured at startup bypasses
//! authentication entirely. Rejections answer 407 with the configured
//! realm.
use std::{net::SocketAddr, sync::Arc};

use base64::Engine as _;
use eyre::{Result, WrapErr};
use http_body_util::{BodyExt, Empty, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{self, HeaderValue},
    server::conn::http1,
    service::service_fn,
    upgrade::Upgraded,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use tokio::net::{TcpListener, TcpStream};

use crate::core::{registry::Registry, route::Account};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub struct HttpProxy {
    registry: Arc<Registry>,
    /// Fixed account; set from `--account` to skip authentication.
    pub account_name: Option<String>,
    /// When unset, any password passes and only the user matters.
    pub password: Option<String>,
    pub realm: String,
    client: Client<HttpConnector, Incoming>,
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

impl HttpProxy {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            account_name: None,
            password: None,
            realm: "Proxy".to_string(),
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("http proxy bind {addr}"))?;
        tracing::info!(addr, "http proxy listening");

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "http accept error");
                    continue;
                }
            };

            let proxy = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { proxy.handle(req, remote).await }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!(error = %e, "http connection error");
                }
            });
        }
    }

    /// Resolve the caller to an account, either via the fixed account or
    /// the Basic proxy credentials. The header is consumed so it never
    /// leaks upstream.
    fn authorize(&self, req: &mut Request<Incoming>) -> Result<Arc<Account>, String> {
        if let Some(name) = &self.account_name {
            return self
                .registry
                .get(name)
                .ok_or_else(|| format!("account not found: {name}"));
        }

        let Some(raw) = req.headers_mut().remove(header::PROXY_AUTHORIZATION) else {
            return Err("missing Proxy-Authorization header".to_string());
        };
        let raw = raw.to_str().map_err(|e| e.to_string())?;

        let (scheme, credential) = raw
            .split_once(' ')
            .ok_or_else(|| "malformed Proxy-Authorization header".to_string())?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(format!("unsupported authentication scheme: {scheme}"));
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(credential.trim())
            .map_err(|e| format!("bad credential encoding: {e}"))?;
        let decoded = String::from_utf8(decoded).map_err(|e| e.to_string())?;
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| "credential is not user:password".to_string())?;

        if let Some(expected) = &self.password {
            if password != expected {
                return Err("password incorrect".to_string());
            }
        }

        self.registry
            .get(user)
            .ok_or_else(|| format!("account not found: {user}"))
    }

    fn unauthorized(&self) -> Response<ProxyBody> {
        let challenge = format!("Basic realm={:?}", self.realm);
        Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(header::PROXY_AUTHENTICATE, challenge)
            .body(empty())
            .expect("static response")
    }

    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        remote: SocketAddr,
    ) -> Result<Response<ProxyBody>, std::convert::Infallible> {
        let account = match self.authorize(&mut req) {
            Ok(account) => account,
            Err(reason) => {
                tracing::debug!(%remote, %reason, "proxy authentication failed");
                return Ok(self.unauthorized());
            }
        };

        if req.method() == Method::CONNECT {
            return Ok(self.connect_tunnel(req, &account));
        }

        // Only absolute-form requests make sense on a forward proxy.
        let (Some(_scheme), Some(authority)) = (req.uri().scheme(), req.uri().authority()) else {
            let response = Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(empty())
                .expect("static response");
            return Ok(response);
        };

        let host = authority.to_string();
        let target = account.routes.replace(&host);
        tracing::debug!(account = %account.name, %host, %target, "forwarding request");

        let mut parts = req.uri().clone().into_parts();
        // "GET http://example.com HTTP/1.1" carries no path at all.
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_static("/"));
        }
        parts.authority = Some(match target.parse() {
            Ok(authority) => authority,
            Err(e) => {
                tracing::warn!(%target, error = %e, "rewritten host is not a valid authority");
                let response = Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(empty())
                    .expect("static response");
                return Ok(response);
            }
        });
        *req.uri_mut() = hyper::Uri::from_parts(parts).expect("uri rebuilt from valid parts");

        let remote_value =
            HeaderValue::from_str(&remote.to_string()).expect("socket address is ascii");
        req.headers_mut()
            .append("x-real-ip", remote_value.clone());
        req.headers_mut().append("x-forwarded-for", remote_value);

        match self.client.request(req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                tracing::debug!(error = %e, "upstream request failed");
                let response = Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(empty())
                    .expect("static response");
                Ok(response)
            }
        }
    }

    /// Answer a CONNECT with 200 and splice the upgraded stream onto a
    /// TCP connection to the rewritten target.
    fn connect_tunnel(&self, req: Request<Incoming>, account: &Account) -> Response<ProxyBody> {
        let host = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let target = account.routes.replace(&host);
        tracing::debug!(account = %account.name, %host, %target, "opening tunnel");

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel(upgraded, &target).await {
                        tracing::debug!(%target, error = %e, "tunnel closed with error");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "connect upgrade failed"),
            }
        });

        Response::new(empty())
    }
}

async fn tunnel(upgraded: Upgraded, target: &str) -> std::io::Result<()> {
    let mut server = TcpStream::connect(target).await?;
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    Ok(())
}
