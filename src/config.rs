//! Studio client configuration.
//!
//! Read from TOML, then optionally overridden from the environment:
//!
//! ```toml
//! api_base_url = "https://studio.example.com/v2"
//! socket_url = "wss://studio.example.com/socket"
//! storage_dir = "/var/lib/studio"
//!
//! [query]
//! stale_time = 30000
//! cache_time = 300000
//! retry = { max_retries = 3, backoff = { kind = "exponential", base = 1000, max = 30000 } }
//! ```
//!
//! | Variable               | Overrides                 |
//! |------------------------|---------------------------|
//! | `STUDIO_API_URL`       | `api_base_url`            |
//! | `STUDIO_SOCKET_URL`    | `socket_url`              |
//! | `STUDIO_STORAGE_DIR`   | `storage_dir`             |
//! | `STUDIO_QUERY_RETRY`   | `query.retry.max_retries` |
//! | `STUDIO_QUERY_STALE_MS`| `query.stale_time`        |

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::QueryConfig;
use crate::resources::HttpResourceApi;
use crate::storage::{FileStore, Storage, StorageError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub api_base_url: String,
    pub socket_url: String,
    /// Where durable client state lives; the platform data directory if unset.
    pub storage_dir: Option<PathBuf>,
    /// Default `tracing` filter, used when `STUDIO_LOG` is unset.
    pub log_filter: String,
    pub query: QueryConfig,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/v2".to_string(),
            socket_url: "ws://localhost:8080/socket".to_string(),
            storage_dir: None,
            log_filter: "studio_cache=info".to_string(),
            query: QueryConfig::default(),
        }
    }
}

impl StudioConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Applies `STUDIO_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STUDIO_API_URL") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("STUDIO_SOCKET_URL") {
            self.socket_url = url;
        }
        if let Some(dir) = lookup("STUDIO_STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(retries) = lookup("STUDIO_QUERY_RETRY") {
            self.query.retry.max_retries = parse("STUDIO_QUERY_RETRY", &retries)?;
        }
        if let Some(stale) = lookup("STUDIO_QUERY_STALE_MS") {
            self.query.stale_time = Duration::from_millis(parse("STUDIO_QUERY_STALE_MS", &stale)?);
        }
        Ok(self)
    }

    /// The HTTP resource API at `api_base_url`.
    pub fn resource_api(&self) -> HttpResourceApi {
        HttpResourceApi::new(self.api_base_url.clone())
    }

    /// File-backed storage at `storage_dir`, or the platform default.
    pub fn open_storage(&self) -> Result<Storage, StorageError> {
        let store = match &self.storage_dir {
            Some(dir) => FileStore::new(dir)?,
            None => FileStore::open_default()?,
        };
        Ok(Storage::new(store))
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::query::{Backoff, RetryPolicy};

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = StudioConfig::from_toml_str("").expect("parse");
        assert_eq!(config, StudioConfig::default());
    }

    #[test]
    fn test_full_toml() {
        let config = StudioConfig::from_toml_str(
            r#"
            api_base_url = "https://studio.example.com/v2"
            storage_dir = "/tmp/studio"

            [query]
            stale_time = 30000
            retry = { max_retries = 1, backoff = { kind = "fixed", delay = 250 } }
            "#,
        )
        .expect("parse");

        assert_eq!(config.api_base_url, "https://studio.example.com/v2");
        assert_eq!(config.socket_url, StudioConfig::default().socket_url);
        assert_eq!(config.storage_dir, Some(PathBuf::from("/tmp/studio")));
        assert_eq!(config.query.stale_time, Duration::from_secs(30));
        assert_eq!(
            config.query.retry,
            RetryPolicy {
                max_retries: 1,
                backoff: Backoff::Fixed {
                    delay: Duration::from_millis(250)
                },
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("STUDIO_API_URL", "https://api.test"),
            ("STUDIO_QUERY_RETRY", "0"),
            ("STUDIO_QUERY_STALE_MS", " 1500 "),
        ]);
        let config = StudioConfig::default()
            .with_overrides(|name| env.get(name).map(|v| (*v).to_string()))
            .expect("overrides");

        assert_eq!(config.api_base_url, "https://api.test");
        assert_eq!(config.query.retry.max_retries, 0);
        assert_eq!(config.query.stale_time, Duration::from_millis(1500));
        assert_eq!(config.storage_dir, None);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = StudioConfig::default()
            .with_overrides(|name| (name == "STUDIO_QUERY_RETRY").then(|| "many".to_string()))
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "STUDIO_QUERY_RETRY"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = StudioConfig::load(&dir.path().join("absent.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_open_storage_in_configured_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StudioConfig {
            storage_dir: Some(dir.path().join("state")),
            ..StudioConfig::default()
        };
        let storage = config.open_storage().expect("storage");
        storage.remember_last_model("m1").expect("write");
        assert!(dir.path().join("state").is_dir());
        assert_eq!(storage.last_model(), Some("m1".to_string()));
    }
}
