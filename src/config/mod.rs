//! TOML configuration

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{CacheSettings, Config, NetworkSettings, PipelineSettings, WorkerSettings};
