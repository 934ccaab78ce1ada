pub mod error;
pub mod health;
pub mod memory;
pub mod nntp;
pub mod pool;
pub mod retry;
pub mod throttle;
pub mod transport;
pub mod types;

pub use error::{ErrorKind, NetworkError, NetworkResult};
pub use health::{ServerHealthTracker, UNHEALTHY_THRESHOLD};
pub use memory::{MemoryConnector, MemoryNewsServer};
pub use nntp::{GroupInfo, NntpClient, NntpSession, SessionConnector, TcpConnector};
pub use pool::{ConnectionPool, PooledSession};
pub use retry::{RetryPolicy, MAX_RETRY_DELAY};
pub use throttle::{mbps_to_bytes, ArticleRateLimiter, BandwidthThrottle};
pub use transport::{PostReceipt, Transport};
pub use types::{HealthStatus, PoolStats, ServerConfig, ServerHealth, ServerKey};
