//! Runtime configuration for an open project.
//!
//! Values come from (in order) built-in defaults, an optional `quire.json`
//! in the project root, and `QUIRE_*` environment variables. Durations are
//! expressed in milliseconds in both the file and the environment.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const CONFIG_FILE_NAME: &str = "quire.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub lock: LockConfig,
    pub index: IndexConfig,
    pub backups: BackupConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Age after which a lock file is presumed abandoned.
    #[serde(with = "millis")]
    pub stale_after: Duration,
    /// Overall time budget for one acquisition.
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub max_nodes: usize,
    pub max_depth: usize,
    pub max_title_len: usize,
    /// Snapshot the index into the backups directory on every load.
    pub backup_on_load: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_nodes: 10_000,
            max_depth: 64,
            max_title_len: 512,
            backup_on_load: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub max_kept: usize,
    /// How long an evicted backup lingers under its `.trash` name.
    #[serde(with = "millis")]
    pub grace_period: Duration,
    /// Period of the background backup task.
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_kept: 10,
            grace_period: Duration::from_secs(300),
            interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "millis")]
    pub ttl: Duration,
    pub max_entries: usize,
    /// Pending writes that trigger an early flush.
    pub batch_size: usize,
    #[serde(with = "millis")]
    pub flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 256,
            batch_size: 16,
            flush_interval: Duration::from_secs(2),
        }
    }
}

impl ProjectConfig {
    /// Load `quire.json` from `root` (if present) and apply environment overrides.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        let mut config = match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                debug!(path = %path.display(), "loading project config");
                serde_json::from_str(&data)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ProjectConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `QUIRE_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored with a warning rather than failing startup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(%key, value = %raw, "ignoring unparseable config override");
                    None
                }
            }
        }
        let ms = |key: &str| parse::<u64>(key, lookup(key)).map(Duration::from_millis);

        if let Some(v) = ms("QUIRE_LOCK_STALE_MS") {
            self.lock.stale_after = v;
        }
        if let Some(v) = ms("QUIRE_LOCK_TIMEOUT_MS") {
            self.lock.timeout = v;
        }
        if let Some(v) = parse("QUIRE_MAX_NODES", lookup("QUIRE_MAX_NODES")) {
            self.index.max_nodes = v;
        }
        if let Some(v) = parse("QUIRE_BACKUP_ON_LOAD", lookup("QUIRE_BACKUP_ON_LOAD")) {
            self.index.backup_on_load = v;
        }
        if let Some(v) = parse("QUIRE_BACKUPS_KEPT", lookup("QUIRE_BACKUPS_KEPT")) {
            self.backups.max_kept = v;
        }
        if let Some(v) = ms("QUIRE_BACKUP_GRACE_MS") {
            self.backups.grace_period = v;
        }
        if let Some(v) = ms("QUIRE_CACHE_TTL_MS") {
            self.cache.ttl = v;
        }
        if let Some(v) = parse("QUIRE_CACHE_MAX_ENTRIES", lookup("QUIRE_CACHE_MAX_ENTRIES")) {
            self.cache.max_entries = v;
        }
        if let Some(v) = parse("QUIRE_CACHE_BATCH", lookup("QUIRE_CACHE_BATCH")) {
            self.cache.batch_size = v;
        }
        if let Some(v) = ms("QUIRE_CACHE_FLUSH_MS") {
            self.cache.flush_interval = v;
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
