use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// The process memory budget the default in-memory capacity is derived from.
const DEFAULT_PROCESS_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

/// Default capacity of the in-memory cache, one eighth of the process memory budget.
pub const DEFAULT_MEMORY_CAPACITY: u64 = DEFAULT_PROCESS_MEMORY_BUDGET / 8;

/// Default capacity of the persistent store in bytes.
pub const DEFAULT_DISK_CAPACITY: u64 = 10 * 1024 * 1024;

/// Default name of the persistent store directory inside the cache directory.
pub const DEFAULT_DISK_NAMESPACE: &str = "picassiette";

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
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
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
            prefix: "picassiette".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Options of the cache layers and the fetch coordinator.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// When disabled, every fetch runs the producer and nothing is cached.
    pub caching_enabled: bool,

    /// Capacity of the in-memory cache, in the units of the configured size function.
    pub memory_capacity: u64,

    /// Capacity of the persistent store in bytes.
    pub disk_capacity: u64,

    /// Name of the persistent store directory inside [`Config::cache_dir`].
    pub disk_namespace: String,

    /// Maximum number of producers running at the same time.
    ///
    /// `None` means unbounded.
    pub max_concurrent_fetches: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            caching_enabled: true,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            disk_capacity: DEFAULT_DISK_CAPACITY,
            disk_namespace: DEFAULT_DISK_NAMESPACE.into(),
            max_concurrent_fetches: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory of the persistent store.
    ///
    /// Leaving this as `None` disables the disk tier, and only the in-memory cache is used.
    pub cache_dir: Option<PathBuf>,

    /// Cache layer options.
    pub cache: CacheConfig,

    /// Logging options.
    pub logging: Logging,

    /// Metrics options.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            cache: CacheConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache_dir, None);
        insta::assert_debug_snapshot!(cfg.cache, @r###"
        CacheConfig {
            caching_enabled: true,
            memory_capacity: 67108864,
            disk_capacity: 10485760,
            disk_namespace: "picassiette",
            max_concurrent_fetches: None,
        }
        "###);
    }

    #[test]
    fn test_partial_cache_config() {
        // Setting individual options must not reset the others to zero values.
        let yaml = r#"
            cache_dir: /tmp/picassiette
            cache:
              disk_capacity: 2048
              max_concurrent_fetches: 4
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/picassiette")));
        assert_eq!(
            cfg.cache,
            CacheConfig {
                disk_capacity: 2048,
                max_concurrent_fetches: Some(4),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown variant `loud`"));
    }

    #[test]
    fn test_empty_config_file() {
        let err = Config::from_reader("  \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }
}
