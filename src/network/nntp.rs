//! NNTP sessions over plain TCP or TLS

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::error::{NetworkError, NetworkResult};
use super::types::{ServerConfig, ServerKey};
use crate::codec::Article;

/// One authenticated conversation with a news server.
#[async_trait]
pub trait NntpSession: Send {
    fn server(&self) -> &ServerKey;

    /// Posts `article` and returns its message-id.
    async fn post(&mut self, article: &Article) -> NetworkResult<String>;

    /// Fetches an article body by message-id, with dot-stuffing removed.
    async fn body(&mut self, message_id: &str) -> NetworkResult<Bytes>;

    async fn stat(&mut self, message_id: &str) -> NetworkResult<bool>;

    async fn group(&mut self, name: &str) -> NetworkResult<GroupInfo>;

    /// Cheap round trip used before reusing an idle session.
    async fn is_alive(&mut self) -> bool;

    async fn quit(&mut self) -> NetworkResult<()>;
}

/// Opens new sessions for the connection pool.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> NetworkResult<Box<dyn NntpSession>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub count: u64,
    pub first: u64,
    pub last: u64,
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// NNTP client over any byte stream.
pub struct NntpClient {
    server: ServerKey,
    stream: BufStream<BoxedStream>,
    io_timeout: Duration,
}

impl NntpClient {
    /// Reads the greeting and, when credentials are configured, logs in.
    pub async fn handshake(
        stream: BoxedStream,
        server: &ServerConfig,
        io_timeout: Duration,
    ) -> NetworkResult<Self> {
        let mut client = Self {
            server: server.key(),
            stream: BufStream::new(stream),
            io_timeout,
        };

        let (code, message) = client.read_response().await?;
        match code {
            200 | 201 => debug!(server = %client.server, code, "Connected"),
            400 | 502 => {
                return Err(NetworkError::ConnectionFailed(format!(
                    "{}: service unavailable ({code} {message})",
                    client.server
                )))
            }
            _ => {
                return Err(NetworkError::Protocol(format!(
                    "unexpected greeting {code} {message}"
                )))
            }
        }

        if let (Some(user), Some(pass)) = (&server.username, &server.password) {
            client.authenticate(user, pass).await?;
        }
        Ok(client)
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> NetworkResult<()> {
        let (code, message) = self.command(&format!("AUTHINFO USER {username}")).await?;
        let (code, message) = match code {
            281 => return Ok(()),
            381 => self.command(&format!("AUTHINFO PASS {password}")).await?,
            _ => (code, message),
        };
        match code {
            281 => {
                debug!(server = %self.server, "Authenticated");
                Ok(())
            }
            481 | 482 | 502 => Err(NetworkError::AuthenticationFailed { code, message }),
            _ => Err(NetworkError::Protocol(format!(
                "unexpected AUTHINFO reply {code} {message}"
            ))),
        }
    }

    pub async fn date(&mut self) -> NetworkResult<String> {
        match self.command("DATE").await? {
            (111, stamp) => Ok(stamp),
            (code, message) => Err(unexpected(code, message)),
        }
    }

    async fn command(&mut self, line: &str) -> NetworkResult<(u16, String)> {
        self.write_all(line.as_bytes()).await?;
        self.write_all(b"\r\n").await?;
        self.flush().await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> NetworkResult<(u16, String)> {
        let line = self.read_line().await?;
        let text = String::from_utf8_lossy(&line);
        let code = text
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| NetworkError::Protocol(format!("malformed response: {text}")))?;
        Ok((code, text.get(4..).unwrap_or("").trim().to_string()))
    }

    /// One line without its CRLF.
    async fn read_line(&mut self) -> NetworkResult<Vec<u8>> {
        let mut line = Vec::new();
        let n = tokio::time::timeout(self.io_timeout, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| NetworkError::Timeout(self.io_timeout))??;
        if n == 0 {
            return Err(NetworkError::ConnectionClosed(self.server.to_string()));
        }
        if line.ends_with(b"\n") {
            line.pop();
        }
        if line.ends_with(b"\r") {
            line.pop();
        }
        Ok(line)
    }

    /// Reads a dot-terminated block, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> NetworkResult<Bytes> {
        let mut out = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            if line == b"." {
                break;
            }
            let line = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
            out.put_slice(line);
            out.put_slice(b"\r\n");
        }
        Ok(out.freeze())
    }

    async fn write_all(&mut self, data: &[u8]) -> NetworkResult<()> {
        tokio::time::timeout(self.io_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| NetworkError::Timeout(self.io_timeout))??;
        Ok(())
    }

    async fn flush(&mut self) -> NetworkResult<()> {
        tokio::time::timeout(self.io_timeout, self.stream.flush())
            .await
            .map_err(|_| NetworkError::Timeout(self.io_timeout))??;
        Ok(())
    }
}

#[async_trait]
impl NntpSession for NntpClient {
    fn server(&self) -> &ServerKey {
        &self.server
    }

    async fn post(&mut self, article: &Article) -> NetworkResult<String> {
        let message_id = article
            .message_id()
            .ok_or_else(|| NetworkError::Protocol("article has no Message-ID".into()))?
            .to_string();

        match self.command("POST").await? {
            (340, _) => {}
            (440, message) => return Err(NetworkError::PostRejected { code: 440, message }),
            (480, message) => {
                return Err(NetworkError::AuthenticationFailed { code: 480, message })
            }
            (code, message) => return Err(unexpected(code, message)),
        }

        let payload = dot_stuff(&article.to_bytes());
        self.write_all(&payload).await?;
        self.write_all(b".\r\n").await?;
        self.flush().await?;

        match self.read_response().await? {
            (240, _) => Ok(message_id),
            (441, message) => Err(NetworkError::PostRejected { code: 441, message }),
            (code, message) => Err(unexpected(code, message)),
        }
    }

    async fn body(&mut self, message_id: &str) -> NetworkResult<Bytes> {
        match self.command(&format!("BODY {message_id}")).await? {
            (222, _) => self.read_multiline().await,
            (430, _) => Err(NetworkError::ArticleNotFound(message_id.to_string())),
            (480, message) => Err(NetworkError::AuthenticationFailed { code: 480, message }),
            (code, message) => Err(unexpected(code, message)),
        }
    }

    async fn stat(&mut self, message_id: &str) -> NetworkResult<bool> {
        match self.command(&format!("STAT {message_id}")).await? {
            (223, _) => Ok(true),
            (430, _) => Ok(false),
            (480, message) => Err(NetworkError::AuthenticationFailed { code: 480, message }),
            (code, message) => Err(unexpected(code, message)),
        }
    }

    async fn group(&mut self, name: &str) -> NetworkResult<GroupInfo> {
        match self.command(&format!("GROUP {name}")).await? {
            (211, rest) => parse_group(&rest),
            (411, _) => Err(NetworkError::Protocol(format!("no such group {name}"))),
            (480, message) => Err(NetworkError::AuthenticationFailed { code: 480, message }),
            (code, message) => Err(unexpected(code, message)),
        }
    }

    async fn is_alive(&mut self) -> bool {
        match self.date().await {
            Ok(_) => true,
            Err(e) => {
                debug!(server = %self.server, error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn quit(&mut self) -> NetworkResult<()> {
        let result = self.command("QUIT").await;
        let _ = self.stream.shutdown().await;
        match result? {
            (205, _) => Ok(()),
            (code, message) => Err(unexpected(code, message)),
        }
    }
}

fn unexpected(code: u16, message: String) -> NetworkError {
    NetworkError::Protocol(format!("unexpected reply {code} {message}"))
}

fn parse_group(rest: &str) -> NetworkResult<GroupInfo> {
    let mut parts = rest.split_whitespace();
    let mut number = || {
        parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| NetworkError::Protocol(format!("malformed GROUP reply: {rest}")))
    };
    let count = number()?;
    let first = number()?;
    let last = number()?;
    let name = parts.next().unwrap_or_default().to_string();
    Ok(GroupInfo {
        name,
        count,
        first,
        last,
    })
}

/// Doubles a leading dot on every line and makes sure the block ends in CRLF.
pub fn dot_stuff(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + data.len() / 64 + 2);
    let mut line_start = true;
    for &b in data {
        if line_start && b == b'.' {
            out.put_u8(b'.');
        }
        out.put_u8(b);
        line_start = b == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.truncate(out.len() - 1);
        }
        out.put_slice(b"\r\n");
    }
    out.freeze()
}

/// Opens TCP sessions, wrapped in TLS when the server asks for it.
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
    tls: Arc<rustls::ClientConfig>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> NetworkResult<Self> {
        Ok(Self {
            connect_timeout,
            io_timeout,
            tls: Arc::new(tls_config()?),
        })
    }
}

fn tls_config() -> NetworkResult<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                if let Err(e) = root_store.add(cert) {
                    warn!("Failed to add certificate to root store: {}", e);
                }
            }
        }
        Err(e) => {
            warn!("Failed to load native certificates: {}. Using webpki roots.", e);
        }
    }

    if root_store.is_empty() {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    Ok(rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::Tls(e.to_string()))?
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self, server: &ServerConfig) -> NetworkResult<Box<dyn NntpSession>> {
        let addr = (server.host.as_str(), server.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(self.connect_timeout))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {e}", server.key())))?;
        let _ = tcp.set_nodelay(true);

        let stream: BoxedStream = if server.use_ssl {
            let name = ServerName::try_from(server.host.clone())
                .map_err(|e| NetworkError::InvalidAddress(format!("{}: {e}", server.host)))?;
            let tls = tokio::time::timeout(
                self.connect_timeout,
                TlsConnector::from(self.tls.clone()).connect(name, tcp),
            )
            .await
            .map_err(|_| NetworkError::Timeout(self.connect_timeout))?
            .map_err(|e| NetworkError::Tls(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let client = tokio::time::timeout(
            self.connect_timeout,
            NntpClient::handshake(stream, server, self.io_timeout),
        )
        .await
        .map_err(|_| NetworkError::Timeout(self.connect_timeout))??;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_dot_stuffing() {
        assert_eq!(dot_stuff(b".a\r\nb\r\n..c").as_ref(), b"..a\r\nb\r\n...c\r\n");
        assert_eq!(dot_stuff(b"x\n").as_ref(), b"x\r\n");
        assert_eq!(dot_stuff(b"").as_ref(), b"\r\n");
    }

    #[test]
    fn test_parse_group() {
        let info = parse_group("42 1 42 alt.binaries.test").unwrap();
        assert_eq!(info.count, 42);
        assert_eq!(info.last, 42);
        assert_eq!(info.name, "alt.binaries.test");
        assert!(parse_group("x").is_err());
    }

    #[tokio::test]
    async fn test_handshake_and_body_over_duplex() {
        let (client_io, mut server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            server_io.write_all(b"200 ready\r\n").await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = server_io.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AUTHINFO USER u\r\n");
            server_io.write_all(b"381 more\r\n").await.unwrap();
            let n = server_io.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AUTHINFO PASS p\r\n");
            server_io.write_all(b"281 ok\r\n").await.unwrap();
            let n = server_io.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"BODY <a@b>\r\n");
            server_io
                .write_all(b"222 0 <a@b>\r\n..dot\r\nplain\r\n.\r\n")
                .await
                .unwrap();
        });

        let config = ServerConfig::new("localhost", 119).with_credentials("u", "p");
        let mut client = NntpClient::handshake(Box::new(client_io), &config, Duration::from_secs(5))
            .await
            .unwrap();
        let body = client.body("<a@b>").await.unwrap();
        assert_eq!(body.as_ref(), b".dot\r\nplain\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let (client_io, mut server_io) = duplex(4096);
        tokio::spawn(async move {
            server_io.write_all(b"201 no posting\r\n").await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = server_io.read(&mut buf).await.unwrap();
            server_io.write_all(b"481 denied\r\n").await.unwrap();
            let _ = server_io.read(&mut buf).await;
        });

        let config = ServerConfig::new("localhost", 119).with_credentials("u", "bad");
        let result =
            NntpClient::handshake(Box::new(client_io), &config, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(NetworkError::AuthenticationFailed { code: 481, .. })
        ));
    }
}
