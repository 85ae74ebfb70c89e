//! The project index: binder model, XML format, validation, the locked
//! on-disk store and its backups.

pub mod backup;
pub mod format;
pub mod model;
pub mod store;
pub mod validate;
pub mod xml;

pub use backup::{BackupManager, PendingDeletion};
pub use model::{is_valid_id, BinderItem, ItemMetadata, ItemType, ProjectIndex};
pub use store::IndexStore;
pub use validate::validate;
