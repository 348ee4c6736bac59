//! SOCKS v5 proxy.
//!
//! Implements the CONNECT command of RFC 1928 with username/password
//! authentication (RFC 1929); the username names the account. When a
//! fixed account is configured, the "no authentication" method is also
//! accepted and resolves to that account. The destination address is
//! rewritten through the account's routes before dialing.
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::core::{registry::Registry, route::Account};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_FAILURE: u8 = 0x05;
const REPLY_CMD_UNSUPPORTED: u8 = 0x07;
const REPLY_ATYP_UNSUPPORTED: u8 = 0x08;

pub struct SocksProxy {
    registry: Arc<Registry>,
    /// Fixed account; set from `--account` to allow no-auth connects.
    pub account_name: Option<String>,
    /// When unset, any password passes and only the user matters.
    pub password: Option<String>,
}

impl SocksProxy {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            account_name: None,
            password: None,
        }
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("socks proxy bind {addr}"))?;
        tracing::info!(addr, "socks proxy listening");

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::debug!(error = %e, "socks accept error");
                    continue;
                }
            };

            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle(stream).await {
                    tracing::debug!(%remote, error = %e, "socks session ended");
                }
            });
        }
    }

    /// Method negotiation plus authentication; hands back the resolved
    /// account, or None after an error reply has been written.
    async fn negotiate(&self, stream: &mut TcpStream) -> Result<Option<Arc<Account>>> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            eyre::bail!("unsupported socks version {}", head[0]);
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        // Prefer the anonymous path when a fixed account makes it valid.
        if methods.contains(&METHOD_NO_AUTH) {
            if let Some(name) = &self.account_name {
                if let Some(account) = self.registry.get(name) {
                    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
                    return Ok(Some(account));
                }
                tracing::debug!(account = %name, "fixed account not found");
            }
        }

        if !methods.contains(&METHOD_USERPASS) {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                .await?;
            return Ok(None);
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_USERPASS]).await?;

        let mut version = [0u8; 1];
        stream.read_exact(&mut version).await?;
        if version[0] != AUTH_VERSION {
            eyre::bail!("unsupported auth subnegotiation version {}", version[0]);
        }

        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await?;
        let mut user = vec![0u8; len[0] as usize];
        stream.read_exact(&mut user).await?;
        stream.read_exact(&mut len).await?;
        let mut password = vec![0u8; len[0] as usize];
        stream.read_exact(&mut password).await?;

        if let Some(expected) = &self.password {
            if password != expected.as_bytes() {
                tracing::debug!("socks password incorrect");
                stream.write_all(&[AUTH_VERSION, 0xFF]).await?;
                return Ok(None);
            }
        }

        let user = String::from_utf8_lossy(&user);
        match self.registry.get(&user) {
            Some(account) => {
                stream.write_all(&[AUTH_VERSION, 0x00]).await?;
                Ok(Some(account))
            }
            None => {
                tracing::debug!(account = %user, "socks account not found");
                stream.write_all(&[AUTH_VERSION, 0xFF]).await?;
                Ok(None)
            }
        }
    }

    async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let Some(account) = self.negotiate(&mut stream).await? else {
            return Ok(());
        };

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            eyre::bail!("unsupported socks version {}", head[0]);
        }
        if head[1] != CMD_CONNECT {
            reply(&mut stream, REPLY_CMD_UNSUPPORTED).await?;
            eyre::bail!("unsupported socks command {}", head[1]);
        }

        let host = match read_dest_addr(&mut stream, head[3]).await? {
            Some(host) => host,
            None => {
                reply(&mut stream, REPLY_ATYP_UNSUPPORTED).await?;
                eyre::bail!("unsupported address type {}", head[3]);
            }
        };

        let target = account.routes.replace(&host);
        tracing::debug!(account = %account.name, %host, %target, "socks connect");

        let mut upstream = match TcpStream::connect(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                reply(&mut stream, REPLY_FAILURE).await?;
                eyre::bail!("connect {target}: {e}");
            }
        };
        reply(&mut stream, REPLY_SUCCESS).await?;

        tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        Ok(())
    }
}

/// Read DST.ADDR + DST.PORT and render them as `host:port`. Unsupported
/// address types are `None`.
async fn read_dest_addr(stream: &mut TcpStream, atyp: u8) -> Result<Option<String>> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).wrap_err("domain is not valid UTF-8")?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            format!("[{}]", std::net::Ipv6Addr::from(addr))
        }
        _ => return Ok(None),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some(format!("{host}:{}", u16::from_be_bytes(port))))
}

/// Write a CONNECT reply with a zeroed bound address.
async fn reply(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
