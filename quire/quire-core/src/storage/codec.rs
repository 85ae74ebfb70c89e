use super::DocumentContent;
use anyhow::{Context, Result};

/// Encoding of a document body on disk.
pub trait ContentCodec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<DocumentContent>;
    fn encode(&self, content: &DocumentContent) -> Result<Vec<u8>>;
    /// File extension (without the dot) of encoded bodies.
    fn extension(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContentCodec;

impl ContentCodec for JsonContentCodec {
    fn decode(&self, raw: &[u8]) -> Result<DocumentContent> {
        serde_json::from_slice(raw).context("decoding document body")
    }

    fn encode(&self, content: &DocumentContent) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(content).context("encoding document body")
    }

    fn extension(&self) -> &str {
        "json"
    }
}
