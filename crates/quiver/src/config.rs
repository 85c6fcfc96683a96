//! Queue configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache::DEFAULT_MAX_BYTES;

/// Number of network worker tasks started by default.
pub const DEFAULT_NETWORK_POOL_SIZE: usize = 4;

/// Configuration for a [`RequestQueue`](crate::RequestQueue).
///
/// All fields have defaults, so an empty config file (or
/// `Config::default()`) yields a working queue.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of network worker tasks.
    pub network_pool_size: usize,

    /// Directory for the disk cache. `None` disables disk caching; the
    /// queue then runs with a [`NoopCache`](crate::NoopCache).
    pub cache_dir: Option<PathBuf>,

    /// On-disk byte budget for the cache.
    pub max_cache_bytes: u64,

    /// Network exchanges slower than this are logged.
    #[serde(with = "humantime_serde")]
    pub slow_request_threshold: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network_pool_size: DEFAULT_NETWORK_POOL_SIZE,
            cache_dir: None,
            max_cache_bytes: DEFAULT_MAX_BYTES,
            slow_request_threshold: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Loads a config from a YAML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open config file at {}", path.display()))?;
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.network_pool_size, DEFAULT_NETWORK_POOL_SIZE);
        assert_eq!(config.max_cache_bytes, DEFAULT_MAX_BYTES);
        assert_eq!(config.cache_dir, None);
    }

    #[test]
    fn test_config_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network_pool_size: 2\ncache_dir: /tmp/quiver\nslow_request_threshold: 500ms"
        )
        .unwrap();

        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.network_pool_size, 2);
        assert_eq!(config.cache_dir.as_deref(), Some(Path::new("/tmp/quiver")));
        assert_eq!(config.slow_request_threshold, Duration::from_millis(500));
    }

    #[test]
    fn test_missing_config_file() {
        assert!(Config::from_path("/nonexistent/quiver.yml").is_err());
    }
}
