//! Storage core for Quire writing projects: a hierarchical binder index
//! persisted as XML under a cross-process lock, per-document bodies, and
//! a write-batching content cache in front of them.

pub mod atomic;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod index;
pub mod layout;
pub mod lock;
pub mod project;
pub mod storage;
pub mod tree;

pub use cache::{CacheStats, ContentCache};
pub use config::ProjectConfig;
pub use error::{Result, StoreError};
pub use events::{BinderEvent, EventBus};
pub use index::{BinderItem, IndexStore, ItemMetadata, ItemType, ProjectIndex};
pub use lock::LockManager;
pub use project::Project;
pub use storage::{DocumentContent, DocumentStore};
pub use tree::{DocumentTree, FlatItem, WordCount};
