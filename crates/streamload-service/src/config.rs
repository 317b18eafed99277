use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::intention::DEFAULT_ATTEMPTS;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
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

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "streamload".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of the loading pipeline.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoadingConfig {
    /// The number of fetches that may run at the same time, across all asset types.
    pub max_concurrent_loads: usize,
    /// The number of attempts against each source for intentions created through
    /// [`Orchestrator::intention`](crate::loading::Orchestrator::intention).
    pub default_attempts: u32,
    /// The size of one range request of a partial download, in bytes.
    pub chunk_size: u64,
    /// The number of idle reassembly buffers kept for reuse.
    pub max_pooled_buffers: usize,
}

impl Default for LoadingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: 15,
            default_attempts: DEFAULT_ATTEMPTS,
            chunk_size: 2 * 1024 * 1024,
            max_pooled_buffers: 32,
        }
    }
}

/// Timeouts of the HTTP fetcher.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// The timeout until the response headers arrived.
    #[serde(with = "humantime_serde")]
    pub head: Duration,
    /// The timeout for one complete request, including the body.
    #[serde(with = "humantime_serde")]
    pub max_download: Duration,
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(1),
            head: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// The DSN to report unexpected failures to.
    pub sentry_dsn: Option<Dsn>,

    /// Admission, retry and chunking settings.
    pub loading: LoadingConfig,

    /// Timeouts of the HTTP fetcher.
    pub timeouts: DownloadTimeouts,

    /// The directory of the on-disk caches.
    ///
    /// Leaving this unset disables caching on disk.
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// Get a config object from a file or the defaults if no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    /// The directory of the cache named `name`, if caching on disk is enabled.
    pub fn cache_dir<P: AsRef<Path>>(&self, name: P) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(name))
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
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
