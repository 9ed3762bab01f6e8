//! Transport: LDAP URLs, TCP connect with timeout, and the plain/TLS stream enum
//! the session reads and writes.

use crate::config::TlsConfig;
use crate::error::{LdapError, Result};
use crate::tls;
use rustls_pki_types::ServerName;
use std::fmt;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Anything the session can run over: TCP, a TLS stream, an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub enum LdapStream {
    Plain(Box<dyn Transport>),
    Tls(Box<ClientTlsStream<Box<dyn Transport>>>),
}

impl LdapStream {
    pub fn plain<T: Transport>(io: T) -> Self {
        LdapStream::Plain(Box::new(io))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, LdapStream::Tls(_))
    }

    /// Run the TLS client handshake over a plain stream.
    pub async fn upgrade(self, connector: &TlsConnector, server_name: ServerName<'static>) -> Result<LdapStream> {
        match self {
            LdapStream::Plain(inner) => {
                let stream = connector
                    .connect(server_name, inner)
                    .await
                    .map_err(|e| LdapError::Tls(format!("handshake failed: {}", e)))?;
                Ok(LdapStream::Tls(Box::new(stream)))
            }
            LdapStream::Tls(_) => Err(LdapError::InvalidState("connection is already encrypted")),
        }
    }
}

impl fmt::Debug for LdapStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LdapStream::Plain(_) => f.write_str("LdapStream::Plain"),
            LdapStream::Tls(_) => f.write_str("LdapStream::Tls"),
        }
    }
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            LdapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// `ldap://host[:port]` or `ldaps://host[:port]`. Anything after the authority
/// (base DN, attributes, scope) is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let lower = url.to_ascii_lowercase();
        let (secure, rest) = if lower.starts_with("ldaps://") {
            (true, &url["ldaps://".len()..])
        } else if lower.starts_with("ldap://") {
            (false, &url["ldap://".len()..])
        } else {
            return Err(LdapError::InvalidUrl(format!("unsupported scheme: {}", url)));
        };
        let default_port = if secure { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(LdapError::InvalidUrl(format!("missing host: {}", url)));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| LdapError::InvalidUrl(format!("unterminated IPv6 literal: {}", url)))?;
            let port = match after {
                "" => None,
                _ => Some(after.strip_prefix(':').ok_or_else(|| {
                    LdapError::InvalidUrl(format!("garbage after IPv6 literal: {}", url))
                })?),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(LdapError::InvalidUrl(format!("missing host: {}", url)));
        }
        let port = match port {
            None | Some("") => default_port,
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| LdapError::InvalidUrl(format!("invalid port {:?} in {}", p, url)))?,
        };
        Ok(LdapUrl {
            secure,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        write!(f, "{}://{}", scheme, self.addr())
    }
}

/// Connector and verified name for a TLS handshake with `host`.
pub fn tls_setup(host: &str, tls_config: Option<&TlsConfig>) -> Result<(TlsConnector, ServerName<'static>)> {
    let connector = tls::connector(tls_config).map_err(|e| LdapError::Tls(format!("{:#}", e)))?;
    let name = tls_config
        .and_then(|t| t.server_name.as_deref())
        .unwrap_or(host);
    let server_name = tls::server_name(name).map_err(|e| LdapError::Tls(format!("{:#}", e)))?;
    Ok((connector, server_name))
}

/// Open a TCP connection (plus the TLS handshake for `ldaps://`) within
/// `connect_timeout`. On failure nothing stays open.
pub async fn connect(url: &LdapUrl, tls_config: Option<&TlsConfig>, connect_timeout: Duration) -> Result<LdapStream> {
    let addr = url.addr();
    let tls_parts = if url.secure {
        Some(tls_setup(&url.host, tls_config)?)
    } else {
        None
    };

    let attempt = async {
        let tcp = TcpStream::connect(&addr).await.map_err(|source| LdapError::Connect {
            addr: addr.clone(),
            source,
        })?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", addr, e);
        }
        let stream = LdapStream::plain(tcp);
        match tls_parts {
            Some((connector, server_name)) => stream.upgrade(&connector, server_name).await,
            None => Ok(stream),
        }
    };

    match tokio::time::timeout(connect_timeout, attempt).await {
        Ok(Ok(stream)) => {
            info!("Connected to {}", url);
            Ok(stream)
        }
        Ok(Err(e)) => {
            debug!("Connect to {} failed: {}", url, e);
            Err(e)
        }
        Err(_) => Err(LdapError::ConnectTimeout {
            addr,
            after: connect_timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_url_default_ports() {
        let url = LdapUrl::parse("ldap://ldap.example.com").unwrap();
        assert_eq!(url, LdapUrl { secure: false, host: "ldap.example.com".into(), port: 389 });
        let url = LdapUrl::parse("ldaps://ldap.example.com/").unwrap();
        assert_eq!(url.port, 636);
        assert!(url.secure);
    }

    #[test]
    fn test_parse_url_explicit_port_and_dn() {
        let url = LdapUrl::parse("LDAP://dir:3389/dc=example,dc=com??sub?(uid=x)").unwrap();
        assert_eq!(url.host, "dir");
        assert_eq!(url.port, 3389);
        assert_eq!(url.addr(), "dir:3389");
        assert_eq!(url.to_string(), "ldap://dir:3389");
    }

    #[test]
    fn test_parse_url_ipv6() {
        let url = LdapUrl::parse("ldaps://[::1]:1636").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 1636);
        assert_eq!(url.addr(), "[::1]:1636");
        assert_eq!(LdapUrl::parse("ldap://[::1]").unwrap().port, 389);
    }

    #[test]
    fn test_parse_url_errors() {
        for bad in [
            "http://host",
            "ldap://",
            "ldap://:389",
            "ldap://host:notaport",
            "ldap://host:70000",
            "ldap://host:0",
            "ldap://[::1",
            "ldap://[::1]x",
        ] {
            assert!(
                matches!(LdapUrl::parse(bad), Err(LdapError::InvalidUrl(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_plain_stream_over_duplex() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = LdapStream::plain(client);
        assert!(!stream.is_secure());
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let stream = connect(&url, None, Duration::from_secs(2)).await.unwrap();
        assert!(!stream.is_secure());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = LdapUrl::parse(&format!("ldap://127.0.0.1:{}", port)).unwrap();
        let err = connect(&url, None, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, LdapError::Connect { .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_ldaps_handshake_failure_is_tls_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hang up without speaking TLS
        tokio::spawn(async move {
            if let Ok((sock, _)) = listener.accept().await {
                drop(sock);
            }
        });
        let url = LdapUrl::parse(&format!("ldaps://127.0.0.1:{}", port)).unwrap();
        let tls = TlsConfig {
            skip_verify: true,
            ..TlsConfig::default()
        };
        let err = connect(&url, Some(&tls), Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, LdapError::Tls(_)), "got {:?}", err);
    }
}
