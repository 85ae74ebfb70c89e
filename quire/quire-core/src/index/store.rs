use super::backup::BackupManager;
use super::format::{index_from_element, index_to_element};
use super::model::ProjectIndex;
use super::validate::validate;
use super::xml;
use crate::atomic::{recover_interrupted, write_verified};
use crate::config::{IndexConfig, ProjectConfig};
use crate::error::{Result, StoreError};
use crate::layout::ProjectLayout;
use crate::lock::LockManager;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// What the store last saw of the index file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
}

/// Owns the canonical index file: locked load and save, backups.
pub struct IndexStore {
    path: PathBuf,
    limits: IndexConfig,
    max_kept: usize,
    lock: LockManager,
    backups: BackupManager,
    seen: Mutex<Option<Fingerprint>>,
}

impl IndexStore {
    pub fn new(layout: &ProjectLayout, config: &ProjectConfig) -> Self {
        Self {
            path: layout.index_path(),
            limits: config.index.clone(),
            max_kept: config.backups.max_kept,
            lock: LockManager::new(layout.lock_path(), config.lock.clone()),
            backups: BackupManager::new(layout.backups_dir(), config.backups.clone()),
            seen: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    /// Read, parse and validate the index under the project lock.
    pub async fn load(&self) -> Result<ProjectIndex> {
        let (index, bytes) = self.lock.with_lock(|| self.load_locked()).await?;
        info!(
            path = %self.path.display(),
            items = index.node_count(),
            bytes,
            "project index loaded"
        );
        Ok(index)
    }

    async fn load_locked(&self) -> Result<(ProjectIndex, usize)> {
        recover_interrupted(&self.path).await?;
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(self.path.display()))
            }
            Err(err) => return Err(err.into()),
        };

        // Every binder level costs two elements (item + Children), metadata three more.
        let root = xml::parse(&bytes, self.limits.max_depth * 2 + 8)?;
        let index = index_from_element(&root, &self.limits)?;
        validate(&index, &self.limits)?;

        if self.limits.backup_on_load {
            self.backups.store(&bytes).await?;
            self.backups.rotate(self.max_kept).await?;
        }
        let seen = self.fingerprint().await?;
        *self.seen.lock() = seen;
        Ok((index, bytes.len()))
    }

    /// Validate, sanitize and atomically replace the index file.
    ///
    /// Refuses with [`StoreError::ExternalModification`] when the file
    /// changed on disk since this store last loaded or saved it.
    pub async fn save(&self, index: &ProjectIndex) -> Result<()> {
        let written = self
            .lock
            .with_lock(|| async {
                self.ensure_not_diverged().await?;
                let items = validate(index, &self.limits)?;
                let bytes = xml::build(&index_to_element(index, &self.limits))?;
                write_verified(&self.path, &bytes).await?;
                let seen = self.fingerprint().await?;
                *self.seen.lock() = seen;
                Ok((items, bytes.len()))
            })
            .await?;
        info!(path = %self.path.display(), items = written.0, bytes = written.1, "project index saved");
        Ok(())
    }

    /// Whether the file on disk differs from what this store last loaded or saved.
    ///
    /// A store that never touched the file has nothing to compare against.
    pub async fn has_diverged(&self) -> Result<bool> {
        let seen = *self.seen.lock();
        match seen {
            None => Ok(false),
            Some(seen) => Ok(self.fingerprint().await? != Some(seen)),
        }
    }

    async fn ensure_not_diverged(&self) -> Result<()> {
        if self.has_diverged().await? {
            return Err(StoreError::ExternalModification {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Copy the current index file into the backups directory.
    pub async fn create_backup(&self) -> Result<PathBuf> {
        self.lock
            .with_lock(|| async {
                let bytes = match tokio::fs::read(&self.path).await {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(StoreError::not_found(self.path.display()))
                    }
                    Err(err) => return Err(err.into()),
                };
                self.backups.store(&bytes).await
            })
            .await
    }

    pub async fn rotate_backups(&self, max_kept: usize) -> Result<usize> {
        self.backups.rotate(max_kept).await
    }

    pub async fn purge_expired_backups(&self) -> Result<usize> {
        self.backups.purge_expired().await
    }

    /// Modification time of the index file, if it exists.
    pub async fn modified(&self) -> Result<Option<SystemTime>> {
        Ok(self.fingerprint().await?.map(|f| f.modified))
    }

    async fn fingerprint(&self) -> Result<Option<Fingerprint>> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(Fingerprint {
                modified: meta.modified()?,
                len: meta.len(),
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "index file absent");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::backup_path;
    use crate::index::model::{BinderItem, ItemType};
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample() -> ProjectIndex {
        let mut scene = BinderItem::new("scene-1", ItemType::Text, "  Opening <scene> & more ");
        scene.metadata.synopsis = "Hero wakes.".into();
        scene.metadata.keywords.insert("draft".into());
        scene
            .metadata
            .custom
            .insert("pov".into(), "\"Ann\" <first>".into());
        let mut index = ProjectIndex::new(vec![
            BinderItem::new("draft", ItemType::Folder, "Draft").with_children(vec![scene]),
            BinderItem::new("research", ItemType::Research, "Research"),
        ]);
        index.trash.push(BinderItem::new("cut", ItemType::Text, "Cut scene"));
        index
    }

    fn store_in(dir: &Path) -> IndexStore {
        let mut config = ProjectConfig::default();
        config.lock.timeout = Duration::from_millis(200);
        IndexStore::new(&ProjectLayout::new(dir), &config)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let index = sample();
        store.save(&index).await.unwrap();

        let fresh = store_in(dir.path());
        assert_eq!(fresh.load().await.unwrap(), index);
        assert!(!store.lock().path().exists());
    }

    #[tokio::test]
    async fn missing_index_is_not_found() {
        let dir = tempdir().unwrap();
        let err = store_in(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_ids_fail_validation() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("project.quire"),
            r#"<QuireProject><Binder>
                 <BinderItem ID="a" Type="Folder"><Children>
                   <BinderItem ID="a" Type="Text"/>
                 </Children></BinderItem>
               </Binder></QuireProject>"#,
        )
        .unwrap();
        let err = store_in(dir.path()).load().await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_index_is_never_written() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut index = sample();
        index.trash.push(BinderItem::new("draft", ItemType::Text, "dup"));
        assert!(matches!(
            store.save(&index).await,
            Err(StoreError::Validation(_))
        ));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn external_change_blocks_save() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.save(&sample()).await.unwrap();

        let other = store_in(dir.path());
        let mut theirs = other.load().await.unwrap();
        theirs.binder.push(BinderItem::new("notes", ItemType::Folder, "Notes and more"));
        other.save(&theirs).await.unwrap();

        assert!(store.has_diverged().await.unwrap());
        let err = store.save(&sample()).await.unwrap_err();
        assert!(matches!(err, StoreError::ExternalModification { .. }));
        assert_eq!(store_in(dir.path()).load().await.unwrap(), theirs);
    }

    #[tokio::test]
    async fn load_restores_interrupted_write_and_backs_up() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let index = sample();
        store.save(&index).await.unwrap();
        std::fs::rename(store.path(), backup_path(store.path())).unwrap();

        let fresh = store_in(dir.path());
        assert_eq!(fresh.load().await.unwrap(), index);
        assert!(!backup_path(store.path()).exists());
        assert_eq!(fresh.backups().list().len(), 1);
    }

    #[tokio::test]
    async fn held_lock_times_out_save() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let _held = store.lock().acquire().await.unwrap();
        let err = store.save(&sample()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
