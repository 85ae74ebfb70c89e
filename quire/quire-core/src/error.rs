use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by the project store, tree and content cache.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("index failed validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("index {} was modified by another process since it was loaded", path.display())]
    ExternalModification { path: PathBuf },
    #[error("malformed index XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("document codec failed: {0}")]
    Codec(#[source] anyhow::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        StoreError::NotFound(what.to_string())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        StoreError::InvalidState(what.into())
    }

    pub(crate) fn validation(what: impl Into<String>) -> Self {
        StoreError::Validation(what.into())
    }

    /// Recover an owned error from one shared between single-flight waiters.
    ///
    /// The last holder gets the original back; everyone else receives an
    /// equivalent error carrying the same kind and message.
    pub(crate) fn from_shared(err: Arc<StoreError>) -> Self {
        match Arc::try_unwrap(err) {
            Ok(owned) => owned,
            Err(shared) => shared.duplicate(),
        }
    }

    fn duplicate(&self) -> Self {
        match self {
            StoreError::LockTimeout { path, waited } => StoreError::LockTimeout {
                path: path.clone(),
                waited: *waited,
            },
            StoreError::Validation(msg) => StoreError::Validation(msg.clone()),
            StoreError::NotFound(msg) => StoreError::NotFound(msg.clone()),
            StoreError::Io(err) => StoreError::Io(std::io::Error::new(err.kind(), err.to_string())),
            StoreError::InvalidState(msg) => StoreError::InvalidState(msg.clone()),
            StoreError::ExternalModification { path } => {
                StoreError::ExternalModification { path: path.clone() }
            }
            other => StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                other.to_string(),
            )),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_error_keeps_kind_for_every_waiter() {
        let shared = Arc::new(StoreError::NotFound("doc-1".into()));
        let other = shared.clone();
        let first = StoreError::from_shared(shared);
        let second = StoreError::from_shared(other);
        assert!(matches!(first, StoreError::NotFound(ref m) if m == "doc-1"));
        assert!(matches!(second, StoreError::NotFound(ref m) if m == "doc-1"));
    }

    #[test]
    fn only_lock_timeouts_are_retryable() {
        let timeout = StoreError::LockTimeout {
            path: PathBuf::from("x.lock"),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_retryable());
        assert!(!StoreError::validation("cycle").is_retryable());
    }
}
