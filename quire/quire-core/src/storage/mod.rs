//! Per-document body storage.
//!
//! Bodies are kept one file per binder id and are linked to the index only
//! by that id. Encoding of a body is delegated to a [`ContentCodec`].

pub mod codec;
pub mod fs;

pub use codec::{ContentCodec, JsonContentCodec};
pub use fs::FsDocumentStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A styled span of the plain text, by char offsets. Opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedRun {
    pub start: usize,
    pub end: usize,
    pub style: String,
}

/// Body of a Text item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub plain_text: String,
    #[serde(default)]
    pub formatted_runs: Vec<FormattedRun>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DocumentContent {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            plain_text: text.into(),
            ..Default::default()
        }
    }

    pub fn word_count(&self) -> usize {
        self.plain_text.split_whitespace().count()
    }

    pub fn char_count(&self) -> usize {
        self.plain_text.chars().count()
    }
}

/// Backing store the content cache reads through and writes to.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `None` when no body has ever been stored for `id`.
    async fn read(&self, id: &str) -> Result<Option<DocumentContent>>;
    /// Durably replace the body of `id`.
    async fn write(&self, id: &str, content: &DocumentContent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_words_and_chars() {
        let content = DocumentContent::plain("  It was a dark\nand stormy night.  ");
        assert_eq!(content.word_count(), 7);
        assert_eq!(content.char_count(), 35);
        assert_eq!(DocumentContent::default().word_count(), 0);
        assert_eq!(DocumentContent::plain("naïve café").char_count(), 10);
    }
}
