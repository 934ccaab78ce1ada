use std::fmt;

use serde::{Deserialize, Serialize};

/// A news server endpoint, the key for health and pool state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
}

impl ServerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
    /// Overrides the pool-wide connection limit for this server.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn default_port() -> u16 {
    563
}

fn default_use_ssl() -> bool {
    true
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_ssl: false,
            max_connections: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "healthy" => HealthStatus::Healthy,
            "degraded" => HealthStatus::Degraded,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealth {
    pub server: ServerKey,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_ms: Option<f64>,
    pub status: HealthStatus,
    pub last_check: i64,
}

impl ServerHealth {
    pub fn new(server: ServerKey) -> Self {
        Self {
            server,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_time_ms: None,
            status: HealthStatus::Unknown,
            last_check: chrono::Utc::now().timestamp(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub server: String,
    pub max_connections: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}
