use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

use crate::caching::{CacheConfig, CachePolicy, FsStore};

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
            prefix: "cacheable".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory in which persisted caches are mirrored, one file per cache name.
    ///
    /// Persistence is disabled when this is not set.
    pub persistence_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Named cache policies.
    pub caches: BTreeMap<String, CachePolicy>,
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

    /// Returns the policy configured under `name`, or the default policy.
    ///
    /// The returned policy always carries `name`, so that persistence and metrics use it.
    pub fn cache_policy(&self, name: &str) -> CachePolicy {
        let mut policy = self.caches.get(name).cloned().unwrap_or_default();
        policy.name.get_or_insert_with(|| name.to_owned());
        policy
    }

    /// Builds the call site configuration for the cache named `name`.
    ///
    /// With a [`persistence_dir`](Self::persistence_dir), the call site is mirrored into it.
    pub fn cache_config<T>(&self, name: &str) -> Result<CacheConfig<T>>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let config = CacheConfig::from_policy(self.cache_policy(name));
        let Some(dir) = &self.persistence_dir else {
            return Ok(config);
        };

        let store = FsStore::new(dir)
            .with_context(|| format!("failed to open persistence dir {}", dir.display()))?;
        Ok(config.persistence(Arc::new(store)))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
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
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_cache_policies() {
        let yaml = r#"
            persistence_dir: /tmp/cacheable
            logging:
              level: debug
              format: json
            caches:
              users:
                max_age: 1500ms
                sliding_expiration: true
                max_cache_count: 5
              search:
                async: true
                hash: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.persistence_dir, Some(PathBuf::from("/tmp/cacheable")));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let users = cfg.cache_policy("users");
        assert_eq!(users.max_age, Some(Duration::from_millis(1500)));
        assert!(users.sliding_expiration);
        assert_eq!(users.max_cache_count, NonZeroUsize::new(5));
        assert_eq!(users.name.as_deref(), Some("users"));

        let search = cfg.cache_policy("search");
        assert!(search.async_delivery);
        assert!(search.hash);
        assert_eq!(search.max_age, None);
    }

    #[test]
    fn test_unknown_cache_uses_default_policy() {
        let cfg = Config::get(None).unwrap();
        let policy = cfg.cache_policy("unknown");
        assert_eq!(policy.max_age, None);
        assert_eq!(policy.max_cache_count, None);
        assert_eq!(policy.name.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_persistence_dir_enables_mirroring() {
        let dir = crate::test::tempdir();
        let cfg = Config {
            persistence_dir: Some(dir.path().join("caches")),
            ..Default::default()
        };

        let config = cfg.cache_config::<String>("users").unwrap();
        assert_eq!(config.cache_name(), "users");
        assert!(format!("{config:?}").contains("JsonMirror"));
        assert!(dir.path().join("caches").is_dir());
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = Config::from_reader("   \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn test_zero_max_cache_count_rejected() {
        let yaml = r#"
            caches:
              users:
                max_cache_count: 0
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }
}
