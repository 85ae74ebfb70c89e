use std::path::{Path, PathBuf};

pub const INDEX_FILE_NAME: &str = "project.quire";
pub const DOCUMENTS_DIR: &str = "documents";
pub const BACKUPS_DIR: &str = "backups";

/// Paths of everything a project keeps under its root directory.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    /// Lock file colocated with the index.
    pub fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.index_path(), "lock")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.root.join(DOCUMENTS_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }
}

/// `dir/name.ext` -> `dir/name.ext.<suffix>`
pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
