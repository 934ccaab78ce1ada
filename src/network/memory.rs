//! In-process news server used by tests and dry runs

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::error::{NetworkError, NetworkResult};
use super::nntp::{GroupInfo, NntpSession, SessionConnector};
use super::types::{ServerConfig, ServerKey};
use crate::codec::Article;

/// Stores posted articles by message-id and can inject failures.
#[derive(Default)]
pub struct MemoryNewsServer {
    articles: DashMap<String, Article>,
    credentials: Option<(String, String)>,
    fail_posts: AtomicU32,
    fail_fetches: AtomicU32,
    fail_connects: AtomicU32,
    reject_all: AtomicBool,
    latency_ms: AtomicU64,
    posts: AtomicU64,
    fetches: AtomicU64,
    misses: AtomicU64,
    connects: AtomicU64,
}

impl MemoryNewsServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_credentials(username: &str, password: &str) -> Arc<Self> {
        Arc::new(Self {
            credentials: Some((username.to_string(), password.to_string())),
            ..Self::default()
        })
    }

    /// The next `n` posts fail with a dropped connection.
    pub fn fail_next_posts(&self, n: u32) {
        self.fail_posts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Answers every post with `441` until switched off.
    pub fn reject_posts(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drops an article, as a provider expiring or taking it down would.
    pub fn remove(&self, message_id: &str) -> bool {
        self.articles.remove(message_id).is_some()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.articles.contains_key(message_id)
    }

    pub fn article(&self, message_id: &str) -> Option<Article> {
        self.articles.get(message_id).map(|a| a.clone())
    }

    pub fn article_count(&self) -> usize {
        self.articles.len()
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// BODY requests answered with 430.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Connects sessions to one or more in-memory servers, keyed by address.
#[derive(Default)]
pub struct MemoryConnector {
    servers: DashMap<ServerKey, Arc<MemoryNewsServer>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(server: &ServerConfig, backend: Arc<MemoryNewsServer>) -> Self {
        let connector = Self::new();
        connector.register(server.key(), backend);
        connector
    }

    pub fn register(&self, key: ServerKey, backend: Arc<MemoryNewsServer>) {
        self.servers.insert(key, backend);
    }
}

#[async_trait]
impl SessionConnector for MemoryConnector {
    async fn connect(&self, server: &ServerConfig) -> NetworkResult<Box<dyn NntpSession>> {
        let key = server.key();
        let backend = self
            .servers
            .get(&key)
            .map(|s| s.clone())
            .ok_or_else(|| NetworkError::ConnectionFailed(format!("{key}: connection refused")))?;

        backend.connects.fetch_add(1, Ordering::SeqCst);
        backend.delay().await;
        if MemoryNewsServer::take_failure(&backend.fail_connects) {
            return Err(NetworkError::ConnectionFailed(format!("{key}: connection reset")));
        }

        if let Some((user, pass)) = &backend.credentials {
            let supplied = (server.username.as_deref(), server.password.as_deref());
            if supplied != (Some(user.as_str()), Some(pass.as_str())) {
                return Err(NetworkError::AuthenticationFailed {
                    code: 481,
                    message: "Authentication rejected".into(),
                });
            }
        }

        Ok(Box::new(MemorySession {
            key,
            backend,
            open: true,
        }))
    }
}

pub struct MemorySession {
    key: ServerKey,
    backend: Arc<MemoryNewsServer>,
    open: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> NetworkResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(NetworkError::ConnectionClosed(self.key.to_string()))
        }
    }
}

#[async_trait]
impl NntpSession for MemorySession {
    fn server(&self) -> &ServerKey {
        &self.key
    }

    async fn post(&mut self, article: &Article) -> NetworkResult<String> {
        self.ensure_open()?;
        self.backend.delay().await;

        if MemoryNewsServer::take_failure(&self.backend.fail_posts) {
            self.open = false;
            return Err(NetworkError::ConnectionClosed(self.key.to_string()));
        }
        if self.backend.reject_all.load(Ordering::SeqCst) {
            return Err(NetworkError::PostRejected {
                code: 441,
                message: "Posting failed".into(),
            });
        }

        let message_id = article
            .message_id()
            .ok_or_else(|| NetworkError::Protocol("article has no Message-ID".into()))?
            .to_string();
        if self.backend.articles.contains_key(&message_id) {
            return Err(NetworkError::PostRejected {
                code: 441,
                message: "Duplicate message-id".into(),
            });
        }

        self.backend.articles.insert(message_id.clone(), article.clone());
        self.backend.posts.fetch_add(1, Ordering::SeqCst);
        Ok(message_id)
    }

    async fn body(&mut self, message_id: &str) -> NetworkResult<Bytes> {
        self.ensure_open()?;
        self.backend.delay().await;

        if MemoryNewsServer::take_failure(&self.backend.fail_fetches) {
            self.open = false;
            return Err(NetworkError::ConnectionClosed(self.key.to_string()));
        }

        let Some(body) = self.backend.articles.get(message_id).map(|a| a.body.clone()) else {
            self.backend.misses.fetch_add(1, Ordering::SeqCst);
            return Err(NetworkError::ArticleNotFound(message_id.to_string()));
        };
        self.backend.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(body)
    }

    async fn stat(&mut self, message_id: &str) -> NetworkResult<bool> {
        self.ensure_open()?;
        Ok(self.backend.contains(message_id))
    }

    async fn group(&mut self, name: &str) -> NetworkResult<GroupInfo> {
        self.ensure_open()?;
        let count = self
            .backend
            .articles
            .iter()
            .filter(|a| {
                a.header("Newsgroups")
                    .map(|groups| groups.split(',').any(|g| g.trim() == name))
                    .unwrap_or(false)
            })
            .count() as u64;
        Ok(GroupInfo {
            name: name.to_string(),
            count,
            first: u64::from(count > 0),
            last: count,
        })
    }

    async fn is_alive(&mut self) -> bool {
        self.open
    }

    async fn quit(&mut self) -> NetworkResult<()> {
        self.open = false;
        Ok(())
    }
}
