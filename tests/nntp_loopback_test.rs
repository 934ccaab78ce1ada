use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use newsvault::codec::{Article, ObfuscationCodec};
use newsvault::download::DownloadRetriever;
use newsvault::network::nntp::dot_stuff;
use newsvault::network::{
    ConnectionPool, NetworkError, NntpSession, RetryPolicy, ServerConfig, ServerHealthTracker,
    SessionConnector, TcpConnector, Transport,
};
use newsvault::segment::RedundancyMode;
use newsvault::upload::{UploadOptions, UploadPipeline};

/// Minimal scripted NNTP server: one task per connection, articles kept in
/// memory by message-id.
struct ScriptedServer {
    articles: Mutex<HashMap<String, Article>>,
    credentials: Option<(String, String)>,
    connections: AtomicUsize,
}

impl ScriptedServer {
    async fn start(credentials: Option<(&str, &str)>) -> (Arc<Self>, u16) {
        let server = Arc::new(Self {
            articles: Mutex::new(HashMap::new()),
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
            connections: AtomicUsize::new(0),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept.connections.fetch_add(1, Ordering::SeqCst);
                let server = accept.clone();
                tokio::spawn(async move {
                    let _ = server.serve(stream).await;
                });
            }
        });
        (server, port)
    }

    async fn serve(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"200 scripted server ready\r\n").await?;

        let mut user = None;
        let mut authed = self.credentials.is_none();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let command = line.trim_end();
            let (verb, arg) = command.split_once(' ').unwrap_or((command, ""));
            let reply: Vec<u8> = match verb.to_ascii_uppercase().as_str() {
                "AUTHINFO" => {
                    let (kind, value) = arg.split_once(' ').unwrap_or((arg, ""));
                    if kind.eq_ignore_ascii_case("USER") {
                        user = Some(value.to_string());
                        b"381 password required\r\n".to_vec()
                    } else {
                        let expected = self.credentials.as_ref();
                        let ok = expected
                            .map(|(u, p)| user.as_deref() == Some(u.as_str()) && value == p)
                            .unwrap_or(true);
                        authed = ok;
                        if ok {
                            b"281 welcome\r\n".to_vec()
                        } else {
                            b"481 rejected\r\n".to_vec()
                        }
                    }
                }
                _ if !authed => b"480 authentication required\r\n".to_vec(),
                "DATE" => b"111 20261019120000\r\n".to_vec(),
                "POST" => {
                    write.write_all(b"340 send article\r\n").await?;
                    let raw = read_dot_block(&mut reader).await?;
                    match Article::parse(&raw) {
                        Ok(article) => {
                            let id = article.message_id().unwrap_or_default().to_string();
                            let mut articles = self.articles.lock();
                            if id.is_empty() || articles.contains_key(&id) {
                                b"441 posting failed\r\n".to_vec()
                            } else {
                                articles.insert(id, article);
                                b"240 article received\r\n".to_vec()
                            }
                        }
                        Err(_) => b"441 posting failed\r\n".to_vec(),
                    }
                }
                "BODY" => {
                    let body = self.articles.lock().get(arg).map(|a| a.body.clone());
                    match body {
                        Some(body) => {
                            let mut out = format!("222 0 {arg}\r\n").into_bytes();
                            out.extend_from_slice(&dot_stuff(&body));
                            out.extend_from_slice(b".\r\n");
                            out
                        }
                        None => b"430 no such article\r\n".to_vec(),
                    }
                }
                "STAT" => {
                    if self.articles.lock().contains_key(arg) {
                        format!("223 0 {arg}\r\n").into_bytes()
                    } else {
                        b"430 no such article\r\n".to_vec()
                    }
                }
                "GROUP" => {
                    let count = self.articles.lock().len();
                    format!("211 {count} 1 {count} {arg}\r\n").into_bytes()
                }
                "QUIT" => {
                    write.write_all(b"205 bye\r\n").await?;
                    return Ok(());
                }
                _ => b"500 unknown command\r\n".to_vec(),
            };
            write.write_all(&reply).await?;
        }
    }

    fn article_count(&self) -> usize {
        self.articles.lock().len()
    }
}

/// Reads up to the lone `.` line and undoes dot-stuffing.
async fn read_dot_block<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(out);
        }
        if line == b".\r\n" || line == b".\n" {
            return Ok(out);
        }
        let start = usize::from(line.starts_with(b".."));
        out.extend_from_slice(&line[start..]);
    }
}

fn connector() -> TcpConnector {
    TcpConnector::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap()
}

fn transport(config: ServerConfig) -> Arc<Transport> {
    let pool = ConnectionPool::new(
        vec![config],
        3,
        Duration::from_secs(5),
        Arc::new(connector()),
        Arc::new(ServerHealthTracker::new()),
    );
    let retry = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5));
    Arc::new(Transport::unthrottled(Arc::new(pool), retry))
}

#[tokio::test]
async fn test_session_commands_over_tcp() {
    let (server, port) = ScriptedServer::start(Some(("reader", "secret"))).await;
    let config = ServerConfig::new("127.0.0.1", port).with_credentials("reader", "secret");

    let mut session = connector().connect(&config).await.unwrap();
    assert!(session.is_alive().await);

    let codec = ObfuscationCodec::new(b"loopback").unwrap();
    let identity = codec.identity("folder", 0, 0);
    let body = Bytes::from_static(b".leading dot\r\nsecond line\r\n");
    let article = Article::for_post(&identity, &["alt.binaries.test".to_string()], body.clone());

    let message_id = session.post(&article).await.unwrap();
    assert_eq!(Some(message_id.as_str()), article.message_id());
    assert_eq!(server.article_count(), 1);

    assert!(session.stat(&message_id).await.unwrap());
    assert!(!session.stat("<missing@test>").await.unwrap());
    assert_eq!(session.body(&message_id).await.unwrap(), body);
    assert!(matches!(
        session.body("<missing@test>").await,
        Err(NetworkError::ArticleNotFound(_))
    ));

    let group = session.group("alt.binaries.test").await.unwrap();
    assert_eq!(group.count, 1);
    assert_eq!(group.name, "alt.binaries.test");

    // same message-id twice is refused
    assert!(matches!(
        session.post(&article).await,
        Err(NetworkError::PostRejected { code: 441, .. })
    ));
    session.quit().await.unwrap();
}

#[tokio::test]
async fn test_wrong_password_is_fatal() {
    let (_server, port) = ScriptedServer::start(Some(("reader", "secret"))).await;
    let config = ServerConfig::new("127.0.0.1", port).with_credentials("reader", "nope");

    let result = connector().connect(&config).await;
    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("login should fail"),
    };
    assert!(matches!(err, NetworkError::AuthenticationFailed { code: 481, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused() {
    // bind then drop to get a port nothing listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = connector()
        .connect(&ServerConfig::new("127.0.0.1", port))
        .await;
    assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_file_round_trip_over_tcp() {
    let (server, port) = ScriptedServer::start(None).await;
    let transport = transport(ServerConfig::new("127.0.0.1", port));

    // dots and CR/LF bytes exercise stuffing and yEnc escaping on the wire
    let data = Bytes::from(
        (0..25_000u32)
            .map(|i| match i % 97 {
                0 => b'.',
                1 => b'\r',
                2 => b'\n',
                _ => (i % 256) as u8,
            })
            .collect::<Vec<_>>(),
    );
    let upload = UploadPipeline::new(
        Arc::new(ObfuscationCodec::new(b"loopback").unwrap()),
        transport.clone(),
        UploadOptions {
            segment_size: 8_000,
            line_length: 128,
            newsgroups: vec!["alt.binaries.test".into()],
            redundancy: RedundancyMode::UniqueCopies { level: 2 },
            segment_concurrency: 3,
        },
    )
    .unwrap();

    let (manifest, report) = upload.upload("file", "folder", &data).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(server.article_count(), 8);
    assert!(server.connections.load(Ordering::SeqCst) <= 3);

    let downloaded = DownloadRetriever::new(transport.clone(), 3)
        .download(&manifest, || true, |_, _| {})
        .await
        .unwrap();
    assert_eq!(downloaded.data, data);

    let key = ServerConfig::new("127.0.0.1", port).key();
    let health = transport.pool().health().get_health(&key);
    assert!(health.success_count >= 12);
    assert_eq!(health.consecutive_failures, 0);
    transport.pool().close().await;
}
