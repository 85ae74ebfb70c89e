//! Cross-process advisory lock over the project index.
//!
//! The lock is a file created with `O_EXCL` holding a JSON [`LockToken`].
//! Ownership is always proven by re-reading the token, never assumed, and a
//! token older than the staleness threshold is treated as abandoned.

use crate::config::LockConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: Uuid,
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub pid: u32,
}

impl LockToken {
    pub fn fresh() -> Self {
        Self {
            owner: Uuid::new_v4(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// Age relative to `now`; a token stamped in the future counts as brand new.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

enum Attempt {
    Acquired(LockGuard),
    /// Someone else holds a live lock.
    Held,
    /// The previous holder vanished or was reclaimed; try again right away.
    Retry,
}

pub struct LockManager {
    path: PathBuf,
    config: LockConfig,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, config: LockConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until the lock is ours or the configured timeout elapses.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let started = Instant::now();
        let mut backoff = self.config.initial_backoff;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let retry_now = match self.try_acquire().await? {
                Attempt::Acquired(guard) => {
                    debug!(path = %self.path.display(), attempts, "lock acquired");
                    return Ok(guard);
                }
                Attempt::Retry => true,
                Attempt::Held => false,
            };

            let waited = started.elapsed();
            if waited >= self.config.timeout {
                warn!(path = %self.path.display(), ?waited, attempts, "lock acquisition timed out");
                return Err(StoreError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }
            if retry_now {
                continue;
            }

            let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let pause = (backoff + Duration::from_millis(jitter_ms))
                .min(self.config.timeout - waited);
            debug!(path = %self.path.display(), ?pause, "lock busy, backing off");
            sleep(pause).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Run `op` while holding the lock, releasing it on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire().await?;
        let outcome = op().await;
        match guard.release().await {
            Ok(_) => outcome,
            Err(err) if outcome.is_ok() => Err(err),
            Err(err) => {
                warn!(error = %err, "failed to release lock after failed operation");
                outcome
            }
        }
    }

    /// Current token on disk, if any (diagnostics only; may be stale by the time it returns).
    pub async fn peek(&self) -> Result<Option<LockToken>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn try_acquire(&self) -> Result<Attempt> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let token = LockToken::fresh();
        let payload = serde_json::to_vec(&token)?;

        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;
        let mut file = match created {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return self.inspect_existing().await
            }
            Err(err) => return Err(err.into()),
        };

        let written = async {
            file.write_all(&payload).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(err.into());
        }

        // Two processes can both believe they created the file when a stale
        // takeover races with a fresh create; only the token on disk counts.
        match self.peek().await? {
            Some(on_disk) if on_disk.owner == token.owner => Ok(Attempt::Acquired(LockGuard {
                path: self.path.clone(),
                token,
                released: false,
            })),
            _ => {
                warn!(path = %self.path.display(), "lock token changed under us, retrying");
                Ok(Attempt::Held)
            }
        }
    }

    async fn inspect_existing(&self) -> Result<Attempt> {
        let observed = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Attempt::Retry),
            Err(err) => return Err(err.into()),
        };

        let age = match serde_json::from_slice::<LockToken>(&observed) {
            Ok(token) => token.age(Utc::now()),
            // Half-written or foreign content: judge it by the file's mtime.
            Err(_) => match tokio::fs::metadata(&self.path).await {
                Ok(meta) => meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .unwrap_or(Duration::ZERO),
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Attempt::Retry),
                Err(err) => return Err(err.into()),
            },
        };

        if age < self.config.stale_after {
            return Ok(Attempt::Held);
        }

        // Compare-and-delete: only remove the exact token judged stale.
        match tokio::fs::read(&self.path).await {
            Ok(current) if current == observed => {
                match tokio::fs::remove_file(&self.path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                info!(path = %self.path.display(), ?age, "reclaimed stale lock");
                Ok(Attempt::Retry)
            }
            Ok(_) => Ok(Attempt::Held),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Attempt::Retry),
            Err(err) => Err(err.into()),
        }
    }
}

/// Proof of lock ownership. Dropping it releases the lock if still owned.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    path: PathBuf,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Remove the lock file if it still carries our token.
    ///
    /// Returns `false` when the lock had already been lost (reclaimed as
    /// stale by another process, or removed by hand).
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "lock vanished before release");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        if !self.owns(&bytes) {
            warn!(path = %self.path.display(), "lock now held by another owner, leaving it");
            return Ok(false);
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn owns(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<LockToken>(bytes)
            .map(|t| t.owner == self.token.owner)
            .unwrap_or(false)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(bytes) = std::fs::read(&self.path) {
            if self.owns(&bytes) {
                if let Err(err) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to release dropped lock");
                }
            }
        }
    }
}
