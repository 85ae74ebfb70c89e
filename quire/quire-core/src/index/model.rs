use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Different kinds of binder items.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemType {
    Text,
    Folder,
    Research,
    Trash,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Text => "Text",
            ItemType::Folder => "Folder",
            ItemType::Research => "Research",
            ItemType::Trash => "Trash",
        }
    }

    /// Whitelisted parse; unknown types are rejected rather than defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(ItemType::Text),
            "Folder" => Some(ItemType::Folder),
            "Research" => Some(ItemType::Research),
            "Trash" => Some(ItemType::Trash),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        !matches!(self, ItemType::Text)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMetadata {
    #[serde(default)]
    pub synopsis: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl ItemMetadata {
    pub fn is_empty(&self) -> bool {
        self.synopsis.is_empty()
            && self.notes.is_empty()
            && self.keywords.is_empty()
            && self.custom.is_empty()
    }
}

/// A node of the binder hierarchy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinderItem {
    pub id: String,
    pub item_type: ItemType,
    pub title: String,
    #[serde(default)]
    pub metadata: ItemMetadata,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub children: Vec<BinderItem>,
}

impl BinderItem {
    pub fn new(id: impl Into<String>, item_type: ItemType, title: impl Into<String>) -> Self {
        let now = timestamp();
        Self {
            id: id.into(),
            item_type,
            title: title.into(),
            metadata: ItemMetadata::default(),
            created: now,
            modified: now,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<BinderItem>) -> Self {
        self.children = children;
        self
    }

    pub fn touch(&mut self) {
        self.modified = timestamp();
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(BinderItem::subtree_len).sum::<usize>()
    }
}

pub const MAX_ID_LEN: usize = 128;

/// Ids double as document file names, so they must be safe path components.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control)
}

/// Timestamps are kept at millisecond precision so they survive the index format unchanged.
pub(crate) fn timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// The whole binder: active root forest plus trash forest.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectIndex {
    pub binder: Vec<BinderItem>,
    pub trash: Vec<BinderItem>,
}

impl ProjectIndex {
    pub fn new(binder: Vec<BinderItem>) -> Self {
        Self {
            binder,
            trash: Vec::new(),
        }
    }

    pub fn node_count(&self) -> usize {
        self.binder
            .iter()
            .chain(self.trash.iter())
            .map(BinderItem::subtree_len)
            .sum()
    }
}
