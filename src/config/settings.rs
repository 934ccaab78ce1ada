use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use crate::codec::DEFAULT_LINE_LENGTH;
use crate::download::{SegmentCache, DEFAULT_CACHE_BYTES, DEFAULT_CACHE_ITEMS};
use crate::network::{mbps_to_bytes, RetryPolicy, ServerConfig, MAX_RETRY_DELAY};
use crate::segment::{RedundancyMode, DEFAULT_SEGMENT_SIZE};

const DEFAULT_REDUNDANCY_LEVEL: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Hex secret keying the internal subjects. Required for uploads.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// SQLite database for queue, health and manifest rows.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub segment_size: usize,
    pub line_length: usize,
    pub newsgroups: Vec<String>,
    pub redundancy: Option<RedundancyMode>,
    /// Shorthand for `redundancy = { mode = "unique_copies", level = N }`.
    pub redundancy_level: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            line_length: DEFAULT_LINE_LENGTH,
            newsgroups: vec!["alt.binaries.test".to_string()],
            redundancy: None,
            redundancy_level: None,
        }
    }
}

impl PipelineSettings {
    pub fn redundancy_mode(&self) -> RedundancyMode {
        match (&self.redundancy, self.redundancy_level) {
            (Some(mode), _) => *mode,
            (None, Some(level)) => RedundancyMode::UniqueCopies { level },
            (None, None) => RedundancyMode::UniqueCopies {
                level: DEFAULT_REDUNDANCY_LEVEL,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Sessions per server unless the server overrides it.
    pub max_connections: usize,
    pub checkout_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// Aggregate cap in megabits per second; 0 means unlimited.
    pub max_rate_mbps: f64,
    pub max_articles_per_second: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            checkout_timeout_secs: 30,
            connect_timeout_secs: 30,
            io_timeout_secs: 60,
            max_rate_mbps: 0.0,
            max_articles_per_second: 0,
        }
    }
}

impl NetworkSettings {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn max_rate_bytes(&self) -> Option<u64> {
        mbps_to_bytes(self.max_rate_mbps)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub upload_workers: usize,
    pub download_workers: usize,
    /// Segments of one file in flight at once.
    pub segment_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            upload_workers: 4,
            download_workers: 4,
            segment_concurrency: num_cpus::get(),
        }
    }
}

/// In-memory cache of verified segments shared by all downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_size_mb: usize,
    pub max_items: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: DEFAULT_CACHE_BYTES / (1024 * 1024),
            max_items: DEFAULT_CACHE_ITEMS,
        }
    }
}

impl CacheSettings {
    pub fn build(&self) -> Option<SegmentCache> {
        self.enabled.then(|| {
            SegmentCache::new(
                self.max_size_mb.saturating_mul(1024 * 1024),
                self.max_items,
            )
        })
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), servers = config.servers.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let pipeline = &self.pipeline;
        if pipeline.segment_size == 0 {
            return Err(invalid("segment_size must be greater than zero"));
        }
        if pipeline.line_length == 0 {
            return Err(invalid("line_length must be greater than zero"));
        }
        if pipeline.newsgroups.is_empty() {
            return Err(invalid("at least one newsgroup is required"));
        }
        if pipeline.redundancy.is_some() && pipeline.redundancy_level.is_some() {
            return Err(invalid("set either redundancy or redundancy_level, not both"));
        }
        pipeline
            .redundancy_mode()
            .validate()
            .map_err(|e| invalid(&e.to_string()))?;

        if self.servers.is_empty() {
            return Err(invalid("at least one server is required"));
        }
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(invalid("server host must not be empty"));
            }
            if server.max_connections == Some(0) {
                return Err(invalid(&format!(
                    "{}: max_connections must be greater than zero",
                    server.key()
                )));
            }
        }
        if self.network.max_connections == 0 {
            return Err(invalid("max_connections must be greater than zero"));
        }
        if !self.network.max_rate_mbps.is_finite() || self.network.max_rate_mbps < 0.0 {
            return Err(invalid("max_rate_mbps must be zero or positive"));
        }

        let retry = &self.retry;
        for (name, value) in [("base_delay", retry.base_delay), ("max_delay", retry.max_delay)] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(&format!("{name} must be a non-negative number")));
            }
            if value > MAX_RETRY_DELAY.as_secs_f64() {
                return Err(invalid(&format!(
                    "{name} must not exceed {} seconds",
                    MAX_RETRY_DELAY.as_secs()
                )));
            }
        }
        if !retry.exponential_base.is_finite() || retry.exponential_base < 1.0 {
            return Err(invalid("exponential_base must be at least 1"));
        }

        if self.cache.enabled && (self.cache.max_size_mb == 0 || self.cache.max_items == 0) {
            return Err(invalid("cache max_size_mb and max_items must be greater than zero"));
        }

        if let Some(secret) = &self.secret_key {
            if hex::decode(secret).map(|k| k.is_empty()).unwrap_or(true) {
                return Err(invalid("secret_key must be non-empty hex"));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
secret_key = "00112233445566778899aabbccddeeff"

[pipeline]
segment_size = 500000
redundancy = { mode = "reed_solomon", data_shards = 10, parity_shards = 2 }

[network]
max_connections = 4
max_rate_mbps = 8.0

[retry]
max_retries = 5
base_delay = 0.5
max_delay = 10.0
exponential_base = 2.0

[[servers]]
host = "news.example.com"
username = "u"
password = "p"
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.pipeline.segment_size, 500_000);
        assert_eq!(config.pipeline.line_length, DEFAULT_LINE_LENGTH);
        assert_eq!(
            config.pipeline.redundancy_mode(),
            RedundancyMode::ReedSolomon {
                data_shards: 10,
                parity_shards: 2
            }
        );
        assert_eq!(config.network.max_rate_bytes(), Some(1_000_000));
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.retry.jitter);

        let server = &config.servers[0];
        assert_eq!(server.port, 563);
        assert!(server.use_ssl);
        assert_eq!(server.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_toml_str("[[servers]]\nhost = \"news.example.com\"\n").unwrap();
        assert_eq!(config.pipeline.segment_size, DEFAULT_SEGMENT_SIZE);
        assert_eq!(
            config.pipeline.redundancy_mode(),
            RedundancyMode::UniqueCopies { level: 3 }
        );
        assert_eq!(config.network.max_connections, 10);
        assert_eq!(config.network.max_rate_bytes(), None);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size_mb, 256);
        assert!(config.cache.build().is_some());
    }

    #[test]
    fn test_cache_section() {
        let config = Config::from_toml_str(
            "[cache]\nenabled = false\n[[servers]]\nhost = \"a\"\n",
        )
        .unwrap();
        assert!(config.cache.build().is_none());

        let config = Config::from_toml_str(
            "[cache]\nmax_size_mb = 1\nmax_items = 2\n[[servers]]\nhost = \"a\"\n",
        )
        .unwrap();
        assert_eq!(config.cache.max_items, 2);
        assert!(config.cache.build().unwrap().is_empty());
    }

    #[test]
    fn test_redundancy_level_shorthand() {
        let config = Config::from_toml_str(
            "[pipeline]\nredundancy_level = 2\n[[servers]]\nhost = \"a\"\n",
        )
        .unwrap();
        assert_eq!(
            config.pipeline.redundancy_mode(),
            RedundancyMode::UniqueCopies { level: 2 }
        );
    }

    #[test]
    fn test_rejects_invalid() {
        let cases = [
            "[pipeline]\nsegment_size = 0\n[[servers]]\nhost = \"a\"\n",
            "[pipeline]\nredundancy_level = 0\n[[servers]]\nhost = \"a\"\n",
            "[retry]\nmax_retries = 3\nbase_delay = -1.0\nmax_delay = 1.0\nexponential_base = 2.0\n[[servers]]\nhost = \"a\"\n",
            "[retry]\nmax_retries = 3\nbase_delay = 1.0\nmax_delay = 1.0\nexponential_base = 0.5\n[[servers]]\nhost = \"a\"\n",
            "secret_key = \"zz\"\n[[servers]]\nhost = \"a\"\n",
            "[retry]\nmax_retries = 3\nbase_delay = 1.0\nmax_delay = 1e30\nexponential_base = 2.0\n[[servers]]\nhost = \"a\"\n",
            "[pipeline]\nsegment_size = 10\n",
            "[cache]\nmax_items = 0\n[[servers]]\nhost = \"a\"\n",
        ];
        for case in cases {
            assert!(
                matches!(Config::from_toml_str(case), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }
        assert!(matches!(
            Config::from_toml_str("servers = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert!(Config::load(Path::new("/nonexistent/newsvault.toml")).is_err());
    }
}
