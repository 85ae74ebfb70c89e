//! Write-verify-rename: a target file is either fully old or fully new.
//!
//! Sequence: write `<name>.tmp` and fsync it, read it back and byte-compare,
//! move the current target aside to `<name>.backup`, promote the temp file,
//! then delete the `.backup`. Any failure after the target was moved aside
//! puts the `.backup` back before the error is returned.

use crate::error::{Result, StoreError};
use crate::layout::sibling_with_suffix;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Points in the write sequence where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    TempWritten,
    TargetMovedAside,
    TempPromoted,
}

pub(crate) fn temp_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "tmp")
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "backup")
}

pub async fn write_verified(path: &Path, bytes: &[u8]) -> Result<()> {
    write_verified_with(path, bytes, |_| Ok(())).await
}

pub(crate) async fn write_verified_with<F>(path: &Path, bytes: &[u8], fault: F) -> Result<()>
where
    F: Fn(Stage) -> std::io::Result<()>,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    let aside = backup_path(path);

    if let Err(err) = write_and_verify(&tmp, bytes, &fault).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err);
    }

    let had_target = match tokio::fs::rename(path, &aside).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
    };

    let promoted = async {
        if had_target {
            fault(Stage::TargetMovedAside)?;
        }
        tokio::fs::rename(&tmp, path).await?;
        fault(Stage::TempPromoted)
    }
    .await;

    if let Err(err) = promoted {
        warn!(path = %path.display(), error = %err, "atomic write failed, rolling back");
        if had_target {
            if let Err(restore) = tokio::fs::rename(&aside, path).await {
                warn!(path = %path.display(), error = %restore, "rollback failed, previous copy left at .backup");
            }
        } else {
            let _ = tokio::fs::remove_file(path).await;
        }
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }

    if had_target {
        if let Err(err) = tokio::fs::remove_file(&aside).await {
            // The new content is in place; a leftover .backup is harmless.
            warn!(path = %aside.display(), error = %err, "could not remove superseded copy");
        }
    }
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

async fn write_and_verify<F>(tmp: &Path, bytes: &[u8], fault: &F) -> Result<()>
where
    F: Fn(Stage) -> std::io::Result<()>,
{
    let mut file = tokio::fs::File::create(tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fault(Stage::TempWritten)?;

    let written = tokio::fs::read(tmp).await?;
    if written != bytes {
        return Err(StoreError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "verification of {} failed: wrote {} bytes, read back {}",
                tmp.display(),
                bytes.len(),
                written.len()
            ),
        )));
    }
    Ok(())
}

/// Undo the traces of an interrupted [`write_verified`] on `path`.
///
/// A missing target with a `.backup` beside it means the process died after
/// moving the target aside; the backup is restored. Stray temp files are
/// removed. Returns `true` when the target was restored.
pub async fn recover_interrupted(path: &Path) -> Result<bool> {
    let aside = backup_path(path);
    let tmp = temp_path(path);
    let mut restored = false;

    let target_exists = tokio::fs::try_exists(path).await?;
    if !target_exists && tokio::fs::try_exists(&aside).await? {
        warn!(path = %path.display(), "restoring file from interrupted write");
        tokio::fs::rename(&aside, path).await?;
        restored = true;
    } else if target_exists && tokio::fs::try_exists(&aside).await? {
        warn!(path = %aside.display(), "removing superseded copy left by interrupted write");
        tokio::fs::remove_file(&aside).await?;
    }
    match tokio::fs::remove_file(&tmp).await {
        Ok(()) => warn!(path = %tmp.display(), "removed stray temp file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(restored)
}
