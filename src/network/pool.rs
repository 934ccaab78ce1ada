//! Bounded, health-aware pool of NNTP sessions

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{select_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::error::{NetworkError, NetworkResult};
use super::health::ServerHealthTracker;
use super::nntp::{NntpSession, SessionConnector};
use super::types::{HealthStatus, PoolStats, ServerConfig, ServerKey};

struct ServerSlot {
    config: ServerConfig,
    key: ServerKey,
    max_connections: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn NntpSession>>>,
    in_use: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// Shares a fixed number of sessions per server across all workers.
///
/// A checkout waits for a free permit, reuses an idle session when it still
/// answers a liveness check and otherwise opens a new one. Sessions go back
/// to the idle list when their guard drops, unless marked broken.
pub struct ConnectionPool {
    slots: Vec<Arc<ServerSlot>>,
    connector: Arc<dyn SessionConnector>,
    health: Arc<ServerHealthTracker>,
    checkout_timeout: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        servers: Vec<ServerConfig>,
        max_connections: usize,
        checkout_timeout: Duration,
        connector: Arc<dyn SessionConnector>,
        health: Arc<ServerHealthTracker>,
    ) -> Self {
        let slots = servers
            .into_iter()
            .map(|config| {
                let max = config.max_connections.unwrap_or(max_connections).max(1);
                Arc::new(ServerSlot {
                    key: config.key(),
                    config,
                    max_connections: max,
                    permits: Arc::new(Semaphore::new(max)),
                    idle: Mutex::new(Vec::new()),
                    in_use: AtomicUsize::new(0),
                    created: AtomicU64::new(0),
                    reused: AtomicU64::new(0),
                    discarded: AtomicU64::new(0),
                })
            })
            .collect();

        Self {
            slots,
            connector,
            health,
            checkout_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn health(&self) -> &Arc<ServerHealthTracker> {
        &self.health
    }

    pub fn servers(&self) -> Vec<ServerKey> {
        self.slots.iter().map(|s| s.key.clone()).collect()
    }

    /// Checks out a session from the best available server.
    ///
    /// Servers are tried best-first by health score. Unhealthy servers are
    /// only used when nothing else is configured.
    pub async fn checkout(&self) -> NetworkResult<PooledSession> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::PoolClosed);
        }
        if self.slots.is_empty() {
            return Err(NetworkError::NoServerAvailable);
        }

        let ranked = self.ranked_slots();

        // Free capacity anywhere wins over waiting on the best server
        for slot in &ranked {
            if let Ok(permit) = slot.permits.clone().try_acquire_owned() {
                return self.open(slot.clone(), permit).await;
            }
        }

        let (slot, permit) = self.acquire_any(&ranked).await?;
        self.open(slot, permit).await
    }

    /// Checks out a session from one specific server.
    pub async fn checkout_from(&self, server: &ServerKey) -> NetworkResult<PooledSession> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::PoolClosed);
        }
        let slot = self
            .slots
            .iter()
            .find(|s| &s.key == server)
            .cloned()
            .ok_or(NetworkError::NoServerAvailable)?;

        let permit = self.acquire(&slot).await?;
        self.open(slot, permit).await
    }

    async fn acquire(&self, slot: &Arc<ServerSlot>) -> NetworkResult<OwnedSemaphorePermit> {
        let started = Instant::now();
        tokio::time::timeout(self.checkout_timeout, slot.permits.clone().acquire_owned())
            .await
            .map_err(|_| NetworkError::CheckoutTimeout {
                server: slot.key.to_string(),
                waited: started.elapsed(),
            })?
            .map_err(|_| NetworkError::PoolClosed)
    }

    /// Waits for whichever of `slots` frees a permit first. Ties go to the
    /// earlier slot.
    async fn acquire_any(
        &self,
        slots: &[Arc<ServerSlot>],
    ) -> NetworkResult<(Arc<ServerSlot>, OwnedSemaphorePermit)> {
        if slots.is_empty() {
            return Err(NetworkError::NoServerAvailable);
        }
        let started = Instant::now();
        let waits: Vec<BoxFuture<'static, _>> = slots
            .iter()
            .map(|slot| {
                let slot = slot.clone();
                async move {
                    let permit = slot.permits.clone().acquire_owned().await;
                    (slot, permit)
                }
                .boxed()
            })
            .collect();

        let ((slot, permit), _, _) = tokio::time::timeout(self.checkout_timeout, select_all(waits))
            .await
            .map_err(|_| NetworkError::CheckoutTimeout {
                server: slots
                    .iter()
                    .map(|s| s.key.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                waited: started.elapsed(),
            })?;
        let permit = permit.map_err(|_| NetworkError::PoolClosed)?;
        Ok((slot, permit))
    }

    fn ranked_slots(&self) -> Vec<Arc<ServerSlot>> {
        let keys = self.servers();
        let ranked = self.health.rank(&keys);
        let usable: Vec<&ServerKey> = ranked
            .iter()
            .filter(|k| {
                self.health.get_health(k).status != HealthStatus::Unhealthy
            })
            .collect();
        let order: Vec<&ServerKey> = if usable.is_empty() {
            ranked.iter().collect()
        } else {
            usable
        };

        order
            .into_iter()
            .filter_map(|k| self.slots.iter().find(|s| &s.key == k).cloned())
            .collect()
    }

    async fn open(
        &self,
        slot: Arc<ServerSlot>,
        permit: OwnedSemaphorePermit,
    ) -> NetworkResult<PooledSession> {
        loop {
            let candidate = slot.idle.lock().pop();
            let Some(mut session) = candidate else { break };
            if session.is_alive().await {
                slot.reused.fetch_add(1, Ordering::Relaxed);
                slot.in_use.fetch_add(1, Ordering::SeqCst);
                return Ok(PooledSession::new(slot, session, permit));
            }
            slot.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(server = %slot.key, "Discarded stale idle session");
        }

        let started = Instant::now();
        match self.connector.connect(&slot.config).await {
            Ok(session) => {
                slot.created.fetch_add(1, Ordering::Relaxed);
                slot.in_use.fetch_add(1, Ordering::SeqCst);
                debug!(server = %slot.key, elapsed = ?started.elapsed(), "Opened session");
                Ok(PooledSession::new(slot, session, permit))
            }
            Err(e) => {
                warn!(server = %slot.key, error = %e, "Failed to open session");
                self.health.update_health(&slot.key, false, None);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.slots
            .iter()
            .map(|slot| PoolStats {
                server: slot.key.to_string(),
                max_connections: slot.max_connections,
                idle: slot.idle.lock().len(),
                in_use: slot.in_use.load(Ordering::SeqCst),
                created: slot.created.load(Ordering::Relaxed),
                reused: slot.reused.load(Ordering::Relaxed),
                discarded: slot.discarded.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuses new checkouts and says goodbye on every idle session.
    /// Sessions still checked out are dropped when returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in &self.slots {
            slot.permits.close();
            let idle: Vec<_> = std::mem::take(&mut *slot.idle.lock());
            for mut session in idle {
                if let Err(e) = session.quit().await {
                    debug!(server = %slot.key, error = %e, "QUIT failed during shutdown");
                }
            }
        }
        info!("Connection pool closed");
    }
}

/// A checked-out session; returns to the pool on drop.
pub struct PooledSession {
    slot: Arc<ServerSlot>,
    session: Option<Box<dyn NntpSession>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn new(
        slot: Arc<ServerSlot>,
        session: Box<dyn NntpSession>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            slot,
            session: Some(session),
            broken: false,
            _permit: permit,
        }
    }

    pub fn server(&self) -> &ServerKey {
        &self.slot.key
    }

    pub fn session(&mut self) -> &mut dyn NntpSession {
        // Only `Drop` takes the session out
        match self.session.as_mut() {
            Some(session) => session.as_mut(),
            None => unreachable!("pooled session used after release"),
        }
    }

    /// Keeps the session from going back to the idle list.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Marks the session broken when `error` leaves it unusable.
    pub fn observe(&mut self, error: &NetworkError) {
        if error.breaks_session() {
            self.broken = true;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.slot.in_use.fetch_sub(1, Ordering::SeqCst);
        if let Some(session) = self.session.take() {
            if self.broken || self.slot.permits.is_closed() {
                self.slot.discarded.fetch_add(1, Ordering::Relaxed);
            } else {
                self.slot.idle.lock().push(session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{MemoryConnector, MemoryNewsServer};

    fn pool_with(
        servers: &[(&str, Arc<MemoryNewsServer>)],
        max: usize,
        timeout: Duration,
    ) -> ConnectionPool {
        let connector = MemoryConnector::new();
        let mut configs = Vec::new();
        for (host, backend) in servers {
            let config = ServerConfig::new(*host, 119);
            connector.register(config.key(), backend.clone());
            configs.push(config);
        }
        ConnectionPool::new(
            configs,
            max,
            timeout,
            Arc::new(connector),
            Arc::new(ServerHealthTracker::new()),
        )
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let backend = MemoryNewsServer::new();
        let pool = pool_with(&[("a", backend.clone())], 2, Duration::from_secs(1));

        {
            let _s = pool.checkout().await.unwrap();
            assert_eq!(pool.stats()[0].in_use, 1);
        }
        assert_eq!(pool.stats()[0].idle, 1);

        let _s = pool.checkout().await.unwrap();
        let stats = &pool.stats()[0];
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(backend.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_checkout_times_out_when_exhausted() {
        let pool = pool_with(&[("a", MemoryNewsServer::new())], 1, Duration::from_millis(50));
        let _held = pool.checkout().await.unwrap();
        assert!(matches!(
            pool.checkout().await,
            Err(NetworkError::CheckoutTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_broken_sessions_are_discarded() {
        let pool = pool_with(&[("a", MemoryNewsServer::new())], 1, Duration::from_secs(1));
        {
            let mut s = pool.checkout().await.unwrap();
            s.observe(&NetworkError::ConnectionClosed("a".into()));
        }
        let stats = &pool.stats()[0];
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn test_waits_on_every_server_when_all_busy() {
        let pool = Arc::new(pool_with(
            &[("a", MemoryNewsServer::new()), ("b", MemoryNewsServer::new())],
            1,
            Duration::from_millis(500),
        ));
        pool.health()
            .update_health(&ServerKey::new("a", 119), true, Some(5));
        let held = pool.checkout().await.unwrap();
        let other = pool.checkout().await.unwrap();
        assert_eq!(held.server(), &ServerKey::new("a", 119));
        assert_eq!(other.server(), &ServerKey::new("b", 119));

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|s| s.server().clone()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // the lower-ranked server frees up while the best one stays busy
        drop(other);
        assert_eq!(waiting.await.unwrap().unwrap(), ServerKey::new("b", 119));
        drop(held);
    }

    #[tokio::test]
    async fn test_prefers_healthy_server() {
        let pool = pool_with(
            &[("a", MemoryNewsServer::new()), ("b", MemoryNewsServer::new())],
            4,
            Duration::from_secs(1),
        );
        let a = ServerKey::new("a", 119);
        let b = ServerKey::new("b", 119);
        for _ in 0..3 {
            pool.health().update_health(&a, false, None);
        }
        pool.health().update_health(&b, true, Some(10));

        let s = pool.checkout().await.unwrap();
        assert_eq!(s.server(), &b);
    }

    #[tokio::test]
    async fn test_connect_failure_counts_against_health() {
        let backend = MemoryNewsServer::new();
        backend.fail_next_connects(1);
        let pool = pool_with(&[("a", backend)], 1, Duration::from_secs(1));
        assert!(pool.checkout().await.is_err());
        let health = pool.health().get_health(&ServerKey::new("a", 119));
        assert_eq!(health.failure_count, 1);

        // permit was released
        assert!(pool.checkout().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let pool = pool_with(&[("a", MemoryNewsServer::new())], 1, Duration::from_secs(1));
        drop(pool.checkout().await.unwrap());
        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.checkout().await, Err(NetworkError::PoolClosed)));
        assert_eq!(pool.stats()[0].idle, 0);
    }
}
