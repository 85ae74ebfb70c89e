use super::{ContentCodec, DocumentContent, DocumentStore, JsonContentCodec};
use crate::atomic::{recover_interrupted, write_verified};
use crate::error::{Result, StoreError};
use crate::index::is_valid_id;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

const LEFTOVER_SUFFIXES: [&str; 2] = [".tmp", ".backup"];

/// `documents/<id>.<ext>` on the local filesystem, written atomically.
pub struct FsDocumentStore {
    dir: PathBuf,
    codec: Arc<dyn ContentCodec>,
}

impl FsDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_codec(dir, Arc::new(JsonContentCodec))
    }

    pub fn with_codec(dir: impl Into<PathBuf>, codec: Arc<dyn ContentCodec>) -> Self {
        Self {
            dir: dir.into(),
            codec,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(StoreError::invalid(format!("unusable document id {id:?}")));
        }
        Ok(self
            .dir
            .join(format!("{id}.{}", self.codec.extension())))
    }

    /// Undo interrupted body writes left in the directory.
    ///
    /// Must run before any reads or writes go through this store. Returns
    /// how many bodies were put back from their `.backup` copy.
    pub async fn repair(&self) -> Result<usize> {
        let targets: BTreeSet<PathBuf> = WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                LEFTOVER_SUFFIXES
                    .iter()
                    .find_map(|suffix| name.strip_suffix(suffix))
                    .map(|target| self.dir.join(target))
            })
            .collect();

        let mut restored = 0;
        for target in &targets {
            if recover_interrupted(target).await? {
                restored += 1;
            }
        }
        if !targets.is_empty() {
            info!(dir = %self.dir.display(), leftovers = targets.len(), restored, "document directory repaired");
        }
        Ok(restored)
    }

    async fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read(&self, id: &str) -> Result<Option<DocumentContent>> {
        let path = self.path_for(id)?;
        let Some(raw) = Self::read_raw(&path).await? else {
            return Ok(None);
        };
        let content = self.codec.decode(&raw).map_err(StoreError::Codec)?;
        debug!(%id, bytes = raw.len(), "document body read");
        Ok(Some(content))
    }

    async fn write(&self, id: &str, content: &DocumentContent) -> Result<()> {
        let path = self.path_for(id)?;
        let raw = self.codec.encode(content).map_err(StoreError::Codec)?;
        write_verified(&path, &raw).await?;
        debug!(%id, bytes = raw.len(), "document body written");
        Ok(())
    }
}
