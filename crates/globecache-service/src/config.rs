//! The YAML configuration file.
//!
//! Every section is optional, missing values take their defaults.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CacheSettings;

/// How log lines are printed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// The `logging` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The level of our own crates. Dependencies only log warnings and errors.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// The format of log lines.
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE`, so that errors carry backtraces.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// The `metrics` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of a statsd server. Metrics are only sent if this is set.
    pub statsd: Option<String>,
    /// The prefix of all metric names.
    pub prefix: String,
    /// If set, every metric carries the hostname in a tag of this name.
    pub hostname_tag: Option<String>,
    /// Tags added to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "globecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Settings of the tile loader worker pools.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// The number of worker tasks per loader.
    pub workers: usize,
    /// The maximum number of pending requests per loader.
    ///
    /// Once exceeded, the lowest ranking request is dropped.
    pub max_pending: usize,
    /// Whether tiles served from the cache are checked with the server.
    pub revalidate: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            max_pending: 4096,
            revalidate: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The disk cache.
    pub cache: CacheSettings,

    /// Configures the logging system.
    pub logging: Logging,

    /// Configures the metrics system.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The timeout for establishing a connection to a tile server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum duration of a single download, including reading the body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The number of consecutive transient failures after which the tile server is disabled.
    ///
    /// `0` never disables the server automatically.
    pub server_failure_threshold: usize,

    /// The delay before a tile that failed transiently is requested again.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// The tile loaders.
    pub loaders: LoaderConfig,

    /// How often a document is fetched again after its cached copy turned out corrupt.
    pub document_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache: CacheSettings::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(60),
            server_failure_threshold: 5,
            retry_delay: Duration::from_secs(2),
            loaders: LoaderConfig::default(),
            document_attempts: 2,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config
            .cache
            .validate()
            .context("invalid cache configuration")?;
        Ok(config)
    }
}

/// Parses log levels such as `info` or `TRACE`.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Str(&level),
            &"one of off, error, warn, info, debug or trace",
        )
    })
}

#[cfg(test)]
mod tests {
    use crate::caching::{DEFAULT_CACHE_SIZE, MIN_CACHE_SIZE};

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert!(cfg.cache.enabled());
        assert_eq!(cfg.cache.max_size(), DEFAULT_CACHE_SIZE);
        assert_eq!(cfg.server_failure_threshold, 5);
        assert_eq!(cfg.retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.loaders, LoaderConfig::default());
        assert_eq!(cfg.document_attempts, 2);
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_partial_config() {
        let yaml = r#"
            cache:
              dir: /var/cache/globe
              max_size: 1048576
            loaders:
              workers: 2
            retry_delay: 500ms
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.dir(), Path::new("/var/cache/globe"));
        assert_eq!(cfg.cache.max_size(), MIN_CACHE_SIZE);
        assert_eq!(cfg.loaders.workers, 2);
        assert_eq!(cfg.loaders.max_pending, 4096);
        assert!(cfg.loaders.revalidate);
        assert_eq!(cfg.retry_delay, Duration::from_millis(500));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.connect_timeout, Config::default().connect_timeout);
    }

    #[test]
    fn test_zero_second_timeouts() {
        // 0s timeouts will not be set to defaults
        let yaml = r#"
            max_download_timeout: 0s
            connect_timeout: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.max_download_timeout, Duration::from_secs(0));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(0));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(Config::from_reader("".as_bytes()).is_err());
        assert!(Config::from_reader("  \n".as_bytes()).is_err());
        assert!(Config::from_reader("cache:\n  max_size: 10".as_bytes()).is_err());
        assert!(Config::from_reader("logging:\n  level: loud".as_bytes()).is_err());
        assert!(Config::from_reader("logging:\n  level: [info]".as_bytes()).is_err());
    }
}
