//! Article posting and fetching over the shared connection pool

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{ErrorKind, NetworkError, NetworkResult};
use super::pool::{ConnectionPool, PooledSession};
use super::retry::RetryPolicy;
use super::throttle::{ArticleRateLimiter, BandwidthThrottle};
use super::types::ServerKey;
use crate::codec::Article;
use crate::metrics::{self, ArticleTimer};

/// Where an article ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReceipt {
    pub server: ServerKey,
    pub message_id: String,
}

/// Everything one article transfer goes through: rate limiting, a pooled
/// session, bandwidth shaping, retries, health bookkeeping and metrics.
pub struct Transport {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    throttle: Arc<BandwidthThrottle>,
    limiter: ArticleRateLimiter,
}

impl Transport {
    pub fn new(
        pool: Arc<ConnectionPool>,
        retry: RetryPolicy,
        throttle: Arc<BandwidthThrottle>,
        limiter: ArticleRateLimiter,
    ) -> Self {
        Self {
            pool,
            retry,
            throttle,
            limiter,
        }
    }

    /// No rate limits.
    pub fn unthrottled(pool: Arc<ConnectionPool>, retry: RetryPolicy) -> Self {
        Self::new(
            pool,
            retry,
            Arc::new(BandwidthThrottle::unlimited()),
            ArticleRateLimiter::unlimited(),
        )
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn throttle(&self) -> &Arc<BandwidthThrottle> {
        &self.throttle
    }

    /// Posts one article, retrying transport failures.
    pub async fn post(&self, article: &Article) -> NetworkResult<PostReceipt> {
        let result = self
            .retry
            .execute_if(
                |attempt| self.post_once(article, attempt),
                NetworkError::is_retryable,
            )
            .await;
        if let Err(e) = &result {
            metrics::record_article_failure("post", e.kind().as_str());
        }
        result
    }

    async fn post_once(&self, article: &Article, attempt: u32) -> NetworkResult<PostReceipt> {
        self.limiter.wait_for_article().await;
        let wire = article.to_bytes();
        // no session is held while shaping
        self.throttle.throttle(wire.len()).await;
        let mut session = self.pool.checkout().await?;

        let timer = ArticleTimer::start("post");
        let result = session.session().post(article).await;
        let result = match result {
            // A retry after a dropped connection may find the first attempt landed
            Err(NetworkError::PostRejected { code, message }) if attempt > 0 => {
                match article.message_id() {
                    Some(id) if matches!(session.session().stat(id).await, Ok(true)) => {
                        debug!(
                            server = %session.server(),
                            message_id = id,
                            "Earlier attempt was accepted"
                        );
                        Ok(id.to_string())
                    }
                    _ => Err(NetworkError::PostRejected { code, message }),
                }
            }
            other => other,
        };
        let elapsed_ms = timer.stop();

        self.settle(&mut session, &result, elapsed_ms);
        let message_id = result?;
        metrics::record_article_posted(&session.server().to_string(), wire.len());
        Ok(PostReceipt {
            server: session.server().clone(),
            message_id,
        })
    }

    /// Fetches an article body, trying every other server before reporting
    /// it missing.
    pub async fn fetch(&self, message_id: &str) -> NetworkResult<Bytes> {
        let missing_on = Mutex::new(None);
        let result = self
            .retry
            .execute_if(
                |_| self.fetch_once(message_id, &missing_on),
                NetworkError::is_retryable,
            )
            .await;
        let result = match result {
            Err(NetworkError::ArticleNotFound(_)) if self.pool.servers().len() > 1 => {
                let missing_on = missing_on.lock().take();
                self.fetch_elsewhere(message_id, missing_on.as_ref()).await
            }
            other => other,
        };
        if let Err(e) = &result {
            metrics::record_article_failure("fetch", e.kind().as_str());
        }
        result
    }

    /// One attempt on the best server. A 430 records which server answered it.
    async fn fetch_once(
        &self,
        message_id: &str,
        missing_on: &Mutex<Option<ServerKey>>,
    ) -> NetworkResult<Bytes> {
        self.limiter.wait_for_article().await;
        let session = self.pool.checkout().await?;
        let server = session.server().clone();
        let result = self.fetch_with(session, message_id).await;
        if matches!(result, Err(NetworkError::ArticleNotFound(_))) {
            *missing_on.lock() = Some(server);
        }
        result
    }

    async fn fetch_elsewhere(
        &self,
        message_id: &str,
        exclude: Option<&ServerKey>,
    ) -> NetworkResult<Bytes> {
        let mut last = NetworkError::ArticleNotFound(message_id.to_string());
        let candidates = self.pool.health().rank(&self.pool.servers());
        for server in candidates.into_iter().filter(|s| Some(s) != exclude) {
            let session = match self.pool.checkout_from(&server).await {
                Ok(session) => session,
                Err(e) => {
                    last = e;
                    continue;
                }
            };
            match self.fetch_with(session, message_id).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    debug!(server = %server, message_id, error = %e, "Fetch failed on server");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn fetch_with(
        &self,
        mut session: PooledSession,
        message_id: &str,
    ) -> NetworkResult<Bytes> {
        let timer = ArticleTimer::start("fetch");
        let result = session.session().body(message_id).await;
        let elapsed_ms = timer.stop();

        self.settle(&mut session, &result, elapsed_ms);
        let body = result?;
        metrics::record_article_fetched(&session.server().to_string(), body.len());
        drop(session);
        self.throttle.throttle(body.len()).await;
        Ok(body)
    }

    /// Existence check against the best server.
    pub async fn stat(&self, message_id: &str) -> NetworkResult<bool> {
        self.retry
            .execute_if(
                |_| async move {
                    let mut session = self.pool.checkout().await?;
                    let result = session.session().stat(message_id).await;
                    if let Err(e) = &result {
                        session.observe(e);
                    }
                    result
                },
                NetworkError::is_retryable,
            )
            .await
    }

    fn settle<T>(&self, session: &mut PooledSession, result: &NetworkResult<T>, elapsed_ms: u64) {
        let health = self.pool.health();
        match result {
            Ok(_) => health.update_health(session.server(), true, Some(elapsed_ms)),
            // A missing article says nothing about the server
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(server = %session.server(), error = %e, "Article operation failed");
                session.observe(e);
                health.update_health(session.server(), false, None);
            }
        }
    }
}
