//! DNS responder.
//!
//! Answers on UDP and TCP for a single fixed account. The question name
//! (trailing dot stripped) runs through the account's routes: an
//! unchanged name is forwarded verbatim to the upstream nameserver,
//! while a rewritten one is answered locally: an A record pointing at
//! the rewritten host, an SPF TXT record, and an MX record. The wire
//! handling lives in [`message`].
pub mod message;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};

use crate::core::registry::Registry;
use message::{
    RCODE_SERVFAIL, Record, RecordData, TYPE_A, TYPE_ANY, TYPE_MX, TYPE_TXT, build_failure,
    build_response, parse_query,
};

const DEFAULT_TTL: u32 = 60;
const FORWARD_ATTEMPTS: usize = 3;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum incoming message size we accept on either transport.
const MAX_MESSAGE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Udp,
    Tcp,
}

pub struct DnsServer {
    registry: Arc<Registry>,
    pub account_name: String,
    /// Upstream resolver for questions no route claims.
    pub name_server: String,
    /// When set, synthesized MX answers point here instead of at the
    /// queried name.
    pub fake_mx: Option<String>,
    pub ttl: u32,
}

impl DnsServer {
    pub fn new(registry: Arc<Registry>, account_name: impl Into<String>) -> Self {
        Self {
            registry,
            account_name: account_name.into(),
            name_server: "8.8.8.8:53".to_string(),
            fake_mx: None,
            ttl: DEFAULT_TTL,
        }
    }

    /// Listen on `addr` over both UDP and TCP.
    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let udp = UdpSocket::bind(addr)
            .await
            .wrap_err_with(|| format!("dns udp bind {addr}"))?;
        let tcp = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("dns tcp bind {addr}"))?;
        tracing::info!(addr, account = %self.account_name, "dns server listening");

        let server = self.clone();
        tokio::spawn(async move { server.serve_tcp(tcp).await });
        self.serve_udp(udp).await
    }

    async fn serve_udp(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let mut buf = [0u8; MAX_MESSAGE];
        loop {
            let (len, peer) = socket
                .recv_from(&mut buf)
                .await
                .wrap_err("dns udp receive")?;
            let query = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle(&query, Transport::Udp).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        tracing::debug!(%peer, error = %e, "dns udp send failed");
                    }
                }
            });
        }
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "dns tcp accept error");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_tcp_conn(stream).await {
                    tracing::debug!(%peer, error = %e, "dns tcp session ended");
                }
            });
        }
    }

    /// One TCP connection may carry a sequence of length-prefixed
    /// queries; answer them until the peer hangs up.
    async fn serve_tcp_conn(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let mut len = [0u8; 2];
            match stream.read_exact(&mut len).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let len = u16::from_be_bytes(len) as usize;
            if len > MAX_MESSAGE {
                eyre::bail!("oversized dns message ({len} bytes)");
            }
            let mut query = vec![0u8; len];
            stream.read_exact(&mut query).await?;

            if let Some(response) = self.handle(&query, Transport::Tcp).await {
                stream
                    .write_all(&(response.len() as u16).to_be_bytes())
                    .await?;
                stream.write_all(&response).await?;
            }
        }
    }

    /// Decide and produce the response bytes for one query. `None` means
    /// the message was not even parseable enough to answer.
    async fn handle(&self, raw: &[u8], transport: Transport) -> Option<Vec<u8>> {
        let query = match parse_query(raw) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed dns query");
                return None;
            }
        };

        let Some(account) = self.registry.get(&self.account_name) else {
            tracing::warn!(account = %self.account_name, "dns account not found");
            return Some(build_failure(&query, RCODE_SERVFAIL));
        };

        let Some(question) = query.question.clone() else {
            tracing::debug!("dns query without question");
            return Some(build_failure(&query, RCODE_SERVFAIL));
        };

        let domain = question.name.as_str();
        let rewritten = account.routes.replace(domain);

        if rewritten == domain {
            return match self.forward(raw, transport).await {
                Some(response) => Some(response),
                None => Some(build_failure(&query, RCODE_SERVFAIL)),
            };
        }
        tracing::debug!(account = %account.name, %domain, %rewritten, "answering locally");

        let mut answers = Vec::new();

        if question.qtype == TYPE_A {
            match self.resolve_v4(&rewritten).await {
                Some(ip) => answers.push(Record {
                    name: question.name.clone(),
                    ttl: self.ttl,
                    data: RecordData::A(ip),
                }),
                None => return Some(build_failure(&query, RCODE_SERVFAIL)),
            }
        }

        if question.qtype == TYPE_TXT || question.qtype == TYPE_ANY {
            answers.push(Record {
                name: question.name.clone(),
                ttl: self.ttl,
                data: RecordData::Txt("v=spf1 mx -all".to_string()),
            });
        }

        if question.qtype == TYPE_MX || question.qtype == TYPE_ANY {
            let exchange = self
                .fake_mx
                .clone()
                .unwrap_or_else(|| question.name.clone());
            answers.push(Record {
                name: question.name.clone(),
                ttl: self.ttl,
                data: RecordData::Mx {
                    preference: 1,
                    exchange,
                },
            });
        }

        Some(build_response(&query, &answers))
    }

    /// Turn the rewritten host into an IPv4 address, resolving through
    /// the system resolver when it is not already a literal.
    async fn resolve_v4(&self, host: &str) -> Option<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Some(ip);
        }

        match tokio::net::lookup_host(format!("{host}:0")).await {
            Ok(addrs) => addrs
                .filter_map(|addr| match addr.ip() {
                    std::net::IpAddr::V4(v4) => Some(v4),
                    std::net::IpAddr::V6(_) => None,
                })
                .next()
                .or_else(|| {
                    tracing::warn!(host, "rewritten host has no IPv4 address");
                    None
                }),
            Err(e) => {
                tracing::warn!(host, error = %e, "rewritten host did not resolve");
                None
            }
        }
    }

    /// Relay the raw query to the upstream nameserver over the same
    /// transport the client used; a few attempts, then give up.
    async fn forward(&self, raw: &[u8], transport: Transport) -> Option<Vec<u8>> {
        for attempt in 1..=FORWARD_ATTEMPTS {
            let result = tokio::time::timeout(FORWARD_TIMEOUT, async {
                match transport {
                    Transport::Udp => self.forward_udp(raw).await,
                    Transport::Tcp => self.forward_tcp(raw).await,
                }
            })
            .await;

            match result {
                Ok(Ok(response)) => return Some(response),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, upstream = %self.name_server, error = %e, "forward failed")
                }
                Err(_) => {
                    tracing::warn!(attempt, upstream = %self.name_server, "forward timed out")
                }
            }
        }
        tracing::warn!(upstream = %self.name_server, "giving up on forward");
        None
    }

    async fn forward_udp(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.name_server).await?;
        socket.send(raw).await?;

        let mut buf = [0u8; MAX_MESSAGE];
        let len = socket.recv(&mut buf).await?;
        Ok(buf[..len].to_vec())
    }

    async fn forward_tcp(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.name_server).await?;
        stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
        stream.write_all(raw).await?;

        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await?;
        let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }
}
