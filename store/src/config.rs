//! Storage configuration.
//!
//! Every value has a compile-time default and can be overridden at runtime
//! through a dedicated environment variable:
//!
//! | Variable | Default |
//! |---|---|
//! | `STATEKEEPER_DATA_DIR` | `$HOME/.config/statekeeper/data`, else `./data` |
//! | `STATEKEEPER_DATABASE_ENABLED` | `true` |
//! | `STATEKEEPER_DATABASE_FILE` | `statekeeper.db` |
//! | `STATEKEEPER_CACHE_SIZE_KIB` | `8192` |
//! | `STATEKEEPER_TIMESTAMP_FALLBACK` | `now` |
//! | `STATEKEEPER_AUTOSAVE_SECS` | `300` |

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineTuning;
use crate::time::TimestampFallback;

const DEFAULT_CONFIG_DIR: &str = ".config/statekeeper/data";
const DEV_DATA_DIR: &str = "./data";
const DEFAULT_DATABASE_FILE: &str = "statekeeper.db";
const DEFAULT_CACHE_SIZE_KIB: u32 = 8192;
const DEFAULT_AUTOSAVE_SECS: u64 = 300;

/// Everything the persistence core needs from the host's configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub database_enabled: bool,
    pub database_file: String,
    pub cache_size_kib: u32,
    pub timestamp_fallback: TimestampFallback,
    pub autosave_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEV_DATA_DIR),
            database_enabled: true,
            database_file: DEFAULT_DATABASE_FILE.to_string(),
            cache_size_kib: DEFAULT_CACHE_SIZE_KIB,
            timestamp_fallback: TimestampFallback::default(),
            autosave_interval: Duration::from_secs(DEFAULT_AUTOSAVE_SECS),
        }
    }
}

impl StorageConfig {
    /// Build the configuration from the environment, falling back to defaults.
    ///
    /// Values that fail to parse are reported and replaced by their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: data_dir_from_env(),
            database_enabled: parsed_env("STATEKEEPER_DATABASE_ENABLED")
                .unwrap_or(defaults.database_enabled),
            database_file: std::env::var("STATEKEEPER_DATABASE_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.database_file),
            cache_size_kib: parsed_env("STATEKEEPER_CACHE_SIZE_KIB")
                .unwrap_or(defaults.cache_size_kib),
            timestamp_fallback: parsed_env("STATEKEEPER_TIMESTAMP_FALLBACK")
                .unwrap_or(defaults.timestamp_fallback),
            autosave_interval: parsed_env("STATEKEEPER_AUTOSAVE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.autosave_interval),
        }
    }

    /// Configuration rooted at `data_dir` with every other value defaulted.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_database_enabled(mut self, enabled: bool) -> Self {
        self.database_enabled = enabled;
        self
    }

    pub fn with_timestamp_fallback(mut self, fallback: TimestampFallback) -> Self {
        self.timestamp_fallback = fallback;
        self
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn engine_tuning(&self) -> EngineTuning {
        EngineTuning {
            cache_size_kib: self.cache_size_kib,
            ..EngineTuning::default()
        }
    }
}

/// Priority:
/// 1. `STATEKEEPER_DATA_DIR` if set
/// 2. `$HOME/.config/statekeeper/data` if `HOME` is set
/// 3. `./data`
fn data_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("STATEKEEPER_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(DEFAULT_CONFIG_DIR);
    }

    PathBuf::from(DEV_DATA_DIR)
}

fn parsed_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid configuration value");
            None
        }
    }
}
