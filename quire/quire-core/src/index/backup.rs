//! Timestamped copies of the index and their rotation.
//!
//! Rotation never deletes straight away: an evicted backup is renamed to
//! `<name>.trash` and recorded in `pending-deletions.json` with the time it
//! becomes deletable. [`BackupManager::purge_expired`] does the physical
//! deletion, so a crash between the two steps loses nothing.

use crate::atomic::write_verified;
use crate::config::BackupConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const PREFIX: &str = "project-";
const EXTENSION: &str = ".quire";
const TRASH_SUFFIX: &str = ".trash";
pub const JOURNAL_FILE_NAME: &str = "pending-deletions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDeletion {
    /// File name inside the backups directory, `.trash` suffix included.
    pub file: String,
    pub due: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    #[serde(default)]
    pending: Vec<PendingDeletion>,
}

pub struct BackupManager {
    dir: PathBuf,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>, config: BackupConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store `bytes` as a new backup and return its path.
    pub async fn store(&self, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let mut path = self.dir.join(format!("{PREFIX}{stamp}{EXTENSION}"));
        let mut n = 1;
        while tokio::fs::try_exists(&path).await? {
            path = self.dir.join(format!("{PREFIX}{stamp}_{n}{EXTENSION}"));
            n += 1;
        }
        write_verified(&path, bytes).await?;
        info!(path = %path.display(), bytes = bytes.len(), "index backup written");
        Ok(path)
    }

    /// Live backups, oldest first. Names sort chronologically.
    pub fn list(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy();
                name.starts_with(PREFIX) && name.ends_with(EXTENSION)
            })
            .map(|entry| entry.into_path())
            .collect();
        found.sort();
        found
    }

    /// Keep the newest `max_kept` backups (at least one); older ones are
    /// moved to `.trash` and scheduled for deletion after the grace period.
    /// Returns how many were evicted.
    pub async fn rotate(&self, max_kept: usize) -> Result<usize> {
        let backups = self.list();
        let keep = max_kept.max(1);
        if backups.len() <= keep {
            return Ok(0);
        }
        let evicted = &backups[..backups.len() - keep];

        let mut journal = self.read_journal().await?;
        let due = self.due_time();
        for path in evicted {
            let file = trash_name(path);
            if !journal.pending.iter().any(|p| p.file == file) {
                journal.pending.push(PendingDeletion { file, due });
            }
        }
        // Intent is durable before anything is renamed.
        self.write_journal(&journal).await?;

        for path in evicted {
            let target = self.dir.join(trash_name(path));
            if let Err(err) = tokio::fs::rename(path, &target).await {
                if err.kind() != ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
            debug!(path = %path.display(), "backup moved to trash");
        }
        info!(evicted = evicted.len(), kept = keep, "rotated index backups");
        Ok(evicted.len())
    }

    /// Delete trashed backups whose grace period has passed.
    ///
    /// `.trash` files missing from the journal (left by a crash before the
    /// journal existed or was readable) are adopted with a fresh due time.
    pub async fn purge_expired(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(0);
        }
        let mut journal = self.read_journal().await?;
        let mut changed = false;

        for orphan in self.trashed_files() {
            if !journal.pending.iter().any(|p| p.file == orphan) {
                warn!(file = %orphan, "adopting untracked trashed backup");
                journal.pending.push(PendingDeletion {
                    file: orphan,
                    due: self.due_time(),
                });
                changed = true;
            }
        }

        let now = Utc::now();
        let mut purged = 0;
        let mut remaining = Vec::with_capacity(journal.pending.len());
        for entry in journal.pending.drain(..) {
            if entry.due > now {
                remaining.push(entry);
                continue;
            }
            match tokio::fs::remove_file(self.dir.join(&entry.file)).await {
                Ok(()) => purged += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(file = %entry.file, error = %err, "could not purge trashed backup");
                    remaining.push(entry);
                    continue;
                }
            }
            changed = true;
        }
        journal.pending = remaining;

        if changed {
            self.write_journal(&journal).await?;
        }
        if purged > 0 {
            info!(purged, "purged expired backups");
        }
        Ok(purged)
    }

    /// Deletions still waiting for their grace period.
    pub async fn pending(&self) -> Result<Vec<PendingDeletion>> {
        Ok(self.read_journal().await?.pending)
    }

    fn due_time(&self) -> DateTime<Utc> {
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        Utc::now() + grace
    }

    fn trashed_files(&self) -> Vec<String> {
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(PREFIX) && name.ends_with(TRASH_SUFFIX))
            .collect()
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE_NAME)
    }

    async fn read_journal(&self) -> Result<Journal> {
        match tokio::fs::read(self.journal_path()).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(journal) => Ok(journal),
                Err(err) => {
                    // Orphan adoption rebuilds it from the trashed files.
                    warn!(error = %err, "deletion journal unreadable, starting afresh");
                    Ok(Journal::default())
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Journal::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_journal(&self, journal: &Journal) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(journal)?;
        write_verified(&self.journal_path(), &bytes).await
    }
}

fn trash_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{name}{TRASH_SUFFIX}")
}
