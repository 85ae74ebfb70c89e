//! An open project: owns the index store, content cache and document tree
//! and the background tasks that keep them persisted.

use crate::cache::ContentCache;
use crate::config::{BackupConfig, ProjectConfig};
use crate::error::{Result, StoreError};
use crate::events::EventBus;
use crate::ids::{IdGenerator, UuidGenerator};
use crate::index::{BinderItem, IndexStore, ItemType, ProjectIndex};
use crate::layout::ProjectLayout;
use crate::storage::fs::FsDocumentStore;
use crate::storage::{DocumentContent, DocumentStore};
use crate::tree::DocumentTree;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Project {
    layout: ProjectLayout,
    config: ProjectConfig,
    store: Arc<IndexStore>,
    cache: Arc<ContentCache>,
    tree: Arc<DocumentTree>,
    events: EventBus,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Project {
    /// Create a new project under `root` with the default top-level folders.
    pub async fn init(root: impl Into<PathBuf>, config: ProjectConfig) -> Result<Self> {
        let layout = ProjectLayout::new(root);
        let store = Arc::new(IndexStore::new(&layout, &config));
        if store.exists().await? {
            return Err(StoreError::invalid(format!(
                "a project already exists at {}",
                layout.root().display()
            )));
        }
        tokio::fs::create_dir_all(layout.documents_dir()).await?;

        let ids = UuidGenerator;
        let index = ProjectIndex::new(vec![
            BinderItem::new(ids.next_id(), ItemType::Folder, "Draft"),
            BinderItem::new(ids.next_id(), ItemType::Research, "Research"),
        ]);
        store.save(&index).await?;
        info!(root = %layout.root().display(), "project created");
        Self::assemble(layout, config, store, index, None).await
    }

    /// Open the project under `root`.
    pub async fn open(root: impl Into<PathBuf>, config: ProjectConfig) -> Result<Self> {
        let layout = ProjectLayout::new(root);
        let store = Arc::new(IndexStore::new(&layout, &config));
        let index = store.load().await?;
        let backed_up = if config.index.backup_on_load {
            store.modified().await?
        } else {
            None
        };
        tokio::fs::create_dir_all(layout.documents_dir()).await?;
        info!(root = %layout.root().display(), items = index.node_count(), "project opened");
        Self::assemble(layout, config, store, index, backed_up).await
    }

    async fn assemble(
        layout: ProjectLayout,
        config: ProjectConfig,
        store: Arc<IndexStore>,
        index: ProjectIndex,
        backed_up: Option<SystemTime>,
    ) -> Result<Self> {
        let documents = FsDocumentStore::new(layout.documents_dir());
        documents.repair().await?;
        let documents: Arc<dyn DocumentStore> = Arc::new(documents);
        let cache = Arc::new(ContentCache::new(documents, config.cache.clone()));
        let events = EventBus::new();
        let tree = Arc::new(DocumentTree::new(
            config.index.clone(),
            Arc::new(UuidGenerator),
            cache.clone(),
            events.clone(),
        ));
        tree.load(index)?;

        let (shutdown, stopped) = watch::channel(false);
        let tasks = vec![
            cache.spawn_flusher(stopped.clone()),
            tokio::spawn(backup_task(
                store.clone(),
                config.backups.clone(),
                backed_up,
                stopped,
            )),
        ];

        Ok(Self {
            layout,
            config,
            store,
            cache,
            tree,
            events,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn tree(&self) -> &Arc<DocumentTree> {
        &self.tree
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Persist the tree if it changed. Returns whether anything was written.
    pub async fn save(&self) -> Result<bool> {
        if !self.tree.is_dirty() {
            return Ok(false);
        }
        let snapshot = self.tree.snapshot()?;
        self.store.save(&snapshot).await?;
        if !self.tree.mark_saved(&snapshot) {
            debug!("tree changed while saving; still dirty");
        }
        Ok(true)
    }

    /// Body of a Text item.
    pub async fn read_document(&self, id: &str) -> Result<DocumentContent> {
        self.ensure_text(id)?;
        self.cache.read(id).await
    }

    pub async fn write_document(
        &self,
        id: &str,
        content: DocumentContent,
        immediate: bool,
    ) -> Result<()> {
        self.ensure_text(id)?;
        self.cache.write(id, content, immediate).await
    }

    fn ensure_text(&self, id: &str) -> Result<()> {
        let item = self.tree.get(id)?;
        if item.item_type != ItemType::Text {
            return Err(StoreError::invalid(format!(
                "{id} is a {} item and has no body",
                item.item_type
            )));
        }
        Ok(())
    }

    /// Snapshot the index now, then apply rotation and purge due deletions.
    pub async fn backup(&self) -> Result<PathBuf> {
        let path = self.store.create_backup().await?;
        self.store.rotate_backups(self.config.backups.max_kept).await?;
        self.store.purge_expired_backups().await?;
        Ok(path)
    }

    /// Stop background tasks, flush queued writes and save the tree.
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        self.cache.flush().await?;
        self.save().await?;
        info!(root = %self.layout.root().display(), "project closed");
        Ok(())
    }
}

/// Periodically back up the index when it changed since the last backup.
async fn backup_task(
    store: Arc<IndexStore>,
    config: BackupConfig,
    mut backed_up: Option<SystemTime>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(config.interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        match backup_if_changed(&store, config.max_kept, backed_up).await {
            Ok(seen) => backed_up = seen,
            Err(err) => warn!(error = %err, "periodic backup failed"),
        }
    }
    debug!("backup task stopped");
}

async fn backup_if_changed(
    store: &IndexStore,
    max_kept: usize,
    backed_up: Option<SystemTime>,
) -> Result<Option<SystemTime>> {
    let modified = store.modified().await?;
    if modified.is_some() && modified != backed_up {
        let path = store.create_backup().await?;
        debug!(path = %path.display(), "periodic backup written");
        store.rotate_backups(max_kept).await?;
    }
    store.purge_expired_backups().await?;
    Ok(modified.or(backed_up))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quiet_config() -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.backups.interval = Duration::from_secs(3600);
        config.cache.flush_interval = Duration::from_secs(3600);
        config
    }

    #[tokio::test]
    async fn init_creates_default_folders_and_refuses_twice() {
        let dir = tempdir().unwrap();
        let project = Project::init(dir.path(), quiet_config()).await.unwrap();
        let titles: Vec<_> = project
            .tree()
            .get_all(false)
            .unwrap()
            .into_iter()
            .map(|i| (i.title, i.item_type))
            .collect();
        assert_eq!(
            titles,
            vec![
                ("Draft".to_string(), ItemType::Folder),
                ("Research".to_string(), ItemType::Research)
            ]
        );
        assert!(!project.tree().is_dirty());
        project.close().await.unwrap();

        assert!(matches!(
            Project::init(dir.path(), quiet_config()).await,
            Err(StoreError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn close_persists_tree_and_bodies() {
        let dir = tempdir().unwrap();
        let project = Project::init(dir.path(), quiet_config()).await.unwrap();
        let draft = project.tree().get_all(false).unwrap()[0].id.clone();
        let scene = project
            .tree()
            .create("Scene", Some(&draft), ItemType::Text)
            .await
            .unwrap();
        project
            .write_document(&scene, DocumentContent::plain("Rain again."), false)
            .await
            .unwrap();
        project.close().await.unwrap();

        let reopened = Project::open(dir.path(), quiet_config()).await.unwrap();
        assert_eq!(reopened.tree().path_of(&scene).unwrap(), vec!["Draft", "Scene"]);
        assert_eq!(
            reopened.read_document(&scene).await.unwrap().plain_text,
            "Rain again."
        );
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn documents_belong_to_text_items() {
        let dir = tempdir().unwrap();
        let project = Project::init(dir.path(), quiet_config()).await.unwrap();
        let draft = project.tree().get_all(false).unwrap()[0].id.clone();
        assert!(matches!(
            project.read_document(&draft).await,
            Err(StoreError::InvalidState(_))
        ));
        assert!(matches!(
            project.read_document("missing").await,
            Err(StoreError::NotFound(_))
        ));
        project.close().await.unwrap();
    }

    #[tokio::test]
    async fn save_is_a_no_op_when_clean() {
        let dir = tempdir().unwrap();
        let project = Project::init(dir.path(), quiet_config()).await.unwrap();
        assert!(!project.save().await.unwrap());
        project
            .tree()
            .create("Notes", None, ItemType::Folder)
            .await
            .unwrap();
        assert!(project.save().await.unwrap());
        assert!(!project.tree().is_dirty());
        project.close().await.unwrap();
    }

    #[tokio::test]
    async fn periodic_backup_skips_unchanged_index() {
        let dir = tempdir().unwrap();
        let project = Project::init(dir.path(), quiet_config()).await.unwrap();
        let store = project.store().clone();

        let seen = backup_if_changed(&store, 5, None).await.unwrap();
        assert!(seen.is_some());
        assert_eq!(store.backups().list().len(), 1);

        let again = backup_if_changed(&store, 5, seen).await.unwrap();
        assert_eq!(again, seen);
        assert_eq!(store.backups().list().len(), 1);
        project.close().await.unwrap();
    }
}
