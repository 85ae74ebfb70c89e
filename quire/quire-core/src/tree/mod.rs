//! In-memory binder hierarchy and its structural operations.
//!
//! Every mutation resolves all ids and checks every rule while holding the
//! write lock, before touching the index, and the critical section never
//! awaits. A failed operation leaves the tree exactly as it was.

use crate::cache::ContentCache;
use crate::config::IndexConfig;
use crate::error::{Result, StoreError};
use crate::events::{BinderEvent, EventBus};
use crate::ids::IdGenerator;
use crate::index::format::sanitize_title;
use crate::index::{is_valid_id, validate, BinderItem, ItemMetadata, ItemType, ProjectIndex};
use crate::storage::DocumentContent;
use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// One node of a depth-first flattening of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatItem {
    pub id: String,
    pub title: String,
    pub item_type: ItemType,
    /// 0 for items directly under the binder (or trash) root.
    pub depth: usize,
    pub parent_id: Option<String>,
    pub in_trash: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WordCount {
    pub words: usize,
    pub chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Binder,
    Trash,
}

/// Where an item sits: which forest, and child indexes from its root.
#[derive(Debug, Clone)]
struct Location {
    container: Container,
    path: Vec<usize>,
}

impl Location {
    fn depth(&self) -> usize {
        self.path.len()
    }

    fn contains(&self, other: &Location) -> bool {
        self.container == other.container
            && other.path.len() > self.path.len()
            && other.path.starts_with(&self.path)
    }
}

#[derive(Default)]
struct TreeState {
    index: Option<ProjectIndex>,
    dirty: bool,
}

pub struct DocumentTree {
    state: RwLock<TreeState>,
    limits: IndexConfig,
    ids: Arc<dyn IdGenerator>,
    cache: Arc<ContentCache>,
    events: EventBus,
}

impl DocumentTree {
    pub fn new(
        limits: IndexConfig,
        ids: Arc<dyn IdGenerator>,
        cache: Arc<ContentCache>,
        events: EventBus,
    ) -> Self {
        Self {
            state: RwLock::new(TreeState::default()),
            limits,
            ids,
            cache,
            events,
        }
    }

    /// Replace the in-memory index. The tree starts clean.
    pub fn load(&self, index: ProjectIndex) -> Result<()> {
        validate(&index, &self.limits)?;
        let mut state = self.state.write();
        state.index = Some(index);
        state.dirty = false;
        Ok(())
    }

    pub fn unload(&self) -> Option<ProjectIndex> {
        let mut state = self.state.write();
        state.dirty = false;
        state.index.take()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().index.is_some()
    }

    /// Whether the tree changed since it was loaded or last marked clean.
    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    pub fn clear_dirty(&self) {
        self.state.write().dirty = false;
    }

    /// Mark the tree clean if it still equals `saved`; a mutation that
    /// raced with the save keeps it dirty.
    pub fn mark_saved(&self, saved: &ProjectIndex) -> bool {
        let mut state = self.state.write();
        if state.index.as_ref() == Some(saved) {
            state.dirty = false;
        }
        !state.dirty
    }

    /// A copy of the current index, for saving.
    pub fn snapshot(&self) -> Result<ProjectIndex> {
        let state = self.state.read();
        Ok(loaded(&state.index)?.clone())
    }

    pub fn get(&self, id: &str) -> Result<BinderItem> {
        let state = self.state.read();
        let index = loaded(&state.index)?;
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        item_at(forest(index, location.container), &location.path)
            .cloned()
            .ok_or_else(|| StoreError::not_found(id))
    }

    /// Titles from the outermost ancestor down to `id` itself.
    pub fn path_of(&self, id: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let index = loaded(&state.index)?;
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        let items = forest(index, location.container);
        Ok((1..=location.path.len())
            .filter_map(|len| item_at(items, &location.path[..len]))
            .map(|item| item.title.clone())
            .collect())
    }

    /// Add a new item under `parent` (or at the binder root) and return its id.
    ///
    /// Text items get an empty body queued in the content cache.
    pub async fn create(
        &self,
        title: &str,
        parent: Option<&str>,
        item_type: ItemType,
    ) -> Result<String> {
        let id = self.insert_new(title, parent, item_type)?;
        if item_type == ItemType::Text {
            self.cache
                .write(&id, DocumentContent::default(), false)
                .await?;
        }
        Ok(id)
    }

    fn insert_new(&self, title: &str, parent: Option<&str>, item_type: ItemType) -> Result<String> {
        if item_type == ItemType::Trash {
            return Err(StoreError::invalid("the trash container cannot be created"));
        }
        let mut state = self.state.write();
        let index = loaded_mut(&mut state.index)?;

        let parent_location = match parent {
            Some(pid) => Some(self.resolve_destination(index, pid)?),
            None => None,
        };
        let depth = parent_location.as_ref().map_or(0, Location::depth) + 1;
        if depth > self.limits.max_depth {
            return Err(StoreError::invalid(format!(
                "items cannot be nested deeper than {} levels",
                self.limits.max_depth
            )));
        }
        if index.node_count() >= self.limits.max_nodes {
            return Err(StoreError::invalid(format!(
                "project already holds {} items",
                self.limits.max_nodes
            )));
        }
        let id = self.ids.next_id();
        if !is_valid_id(&id) || locate(index, &id).is_some() {
            return Err(StoreError::invalid(format!("generated id {id:?} is unusable")));
        }

        let item = BinderItem::new(
            id.clone(),
            item_type,
            sanitize_title(title, self.limits.max_title_len),
        );
        let siblings = match &parent_location {
            Some(location) => item_at_mut(&mut index.binder, &location.path).map(|p| &mut p.children),
            None => Some(&mut index.binder),
        };
        let Some(siblings) = siblings else {
            return Err(StoreError::invalid("destination vanished during create"));
        };
        siblings.push(item);
        state.dirty = true;
        drop(state);

        debug!(%id, ?parent, %item_type, "binder item created");
        self.events.send(BinderEvent::Created {
            id: id.clone(),
            parent: parent.map(str::to_string),
            item_type,
        });
        Ok(id)
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<()> {
        let title = sanitize_title(title, self.limits.max_title_len);
        self.update_item(id, |item| item.title = title.clone())?;
        self.events.send(BinderEvent::Renamed {
            id: id.to_string(),
            title,
        });
        Ok(())
    }

    pub fn update_metadata(&self, id: &str, metadata: ItemMetadata) -> Result<()> {
        self.update_item(id, |item| item.metadata = metadata)?;
        self.events.send(BinderEvent::MetadataUpdated { id: id.to_string() });
        Ok(())
    }

    fn update_item(&self, id: &str, apply: impl FnOnce(&mut BinderItem)) -> Result<()> {
        let mut state = self.state.write();
        let index = loaded_mut(&mut state.index)?;
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        let item = item_at_mut(forest_mut(index, location.container), &location.path)
            .ok_or_else(|| StoreError::not_found(id))?;
        apply(item);
        item.touch();
        state.dirty = true;
        Ok(())
    }

    /// Move an active item (with its subtree) under `new_parent`, or to the binder root.
    pub fn move_item(&self, id: &str, new_parent: Option<&str>) -> Result<()> {
        if new_parent == Some(id) {
            return Err(StoreError::invalid(format!("cannot move {id} into itself")));
        }
        let mut state = self.state.write();
        let index = loaded_mut(&mut state.index)?;

        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        if location.container == Container::Trash {
            return Err(StoreError::invalid(format!(
                "{id} is in the trash; recover it instead"
            )));
        }
        let destination = match new_parent {
            Some(pid) => {
                let dest = self.resolve_destination(index, pid)?;
                if location.contains(&dest) {
                    return Err(StoreError::invalid(format!(
                        "cannot move {id} into its own descendant {pid}"
                    )));
                }
                Some(dest)
            }
            None => None,
        };
        let height = item_at(&index.binder, &location.path).map_or(1, subtree_height);
        let base = destination.as_ref().map_or(0, Location::depth);
        if base + height > self.limits.max_depth {
            return Err(StoreError::invalid(format!(
                "moving {id} would nest items deeper than {} levels",
                self.limits.max_depth
            )));
        }

        let target = destination.map(|dest| shift_after_removal(&location.path, &dest.path));
        transplant(&mut index.binder, &location.path, target.as_deref())?;
        state.dirty = true;
        drop(state);

        debug!(%id, ?new_parent, "binder item moved");
        self.events.send(BinderEvent::Moved {
            id: id.to_string(),
            new_parent: new_parent.map(str::to_string),
        });
        Ok(())
    }

    /// Soft delete: move the item and its subtree to the trash root.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        let index = loaded_mut(&mut state.index)?;
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        if location.container == Container::Trash {
            return Err(StoreError::invalid(format!("{id} is already in the trash")));
        }
        let item = detach(&mut index.binder, &location.path).ok_or_else(|| StoreError::not_found(id))?;
        let moved = item.subtree_len();
        index.trash.push(touched(item));
        state.dirty = true;
        drop(state);

        info!(%id, items = moved, "moved to trash");
        self.events.send(BinderEvent::Trashed { id: id.to_string() });
        Ok(())
    }

    /// Bring a trashed item (with its subtree) back under `target`, or to the binder root.
    pub fn recover(&self, id: &str, target: Option<&str>) -> Result<()> {
        let mut state = self.state.write();
        let index = loaded_mut(&mut state.index)?;
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        if location.container != Container::Trash {
            return Err(StoreError::invalid(format!("{id} is not in the trash")));
        }
        let destination = match target {
            Some(pid) => Some(self.resolve_destination(index, pid)?),
            None => None,
        };
        let height = item_at(&index.trash, &location.path).map_or(1, subtree_height);
        let base = destination.as_ref().map_or(0, Location::depth);
        if base + height > self.limits.max_depth {
            return Err(StoreError::invalid(format!(
                "recovering {id} there would nest items deeper than {} levels",
                self.limits.max_depth
            )));
        }

        let item = detach(&mut index.trash, &location.path).ok_or_else(|| StoreError::not_found(id))?;
        let dest_path = destination.map(|d| d.path);
        let siblings = match &dest_path {
            Some(path) => item_at_mut(&mut index.binder, path).map(|p| &mut p.children),
            None => Some(&mut index.binder),
        };
        match siblings {
            Some(siblings) => siblings.push(touched(item)),
            None => {
                restore(&mut index.trash, &location.path, item);
                return Err(StoreError::invalid("recovery target vanished"));
            }
        }
        state.dirty = true;
        drop(state);

        info!(%id, ?target, "recovered from trash");
        self.events.send(BinderEvent::Recovered {
            id: id.to_string(),
            new_parent: target.map(str::to_string),
        });
        Ok(())
    }

    /// Depth-first flattening of the binder, followed by the trash if asked.
    pub fn get_all(&self, include_trash: bool) -> Result<Vec<FlatItem>> {
        let state = self.state.read();
        let index = loaded(&state.index)?;
        let mut out = Vec::with_capacity(index.node_count());
        flatten(&index.binder, false, &mut out);
        if include_trash {
            flatten(&index.trash, true, &mut out);
        }
        Ok(out)
    }

    /// Words and characters of every Text body under `id`, or of the whole
    /// active binder when `id` is `None`.
    pub async fn word_count(&self, id: Option<&str>) -> Result<WordCount> {
        let text_ids = {
            let state = self.state.read();
            let index = loaded(&state.index)?;
            let mut ids = Vec::new();
            match id {
                Some(id) => {
                    let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
                    if let Some(item) = item_at(forest(index, location.container), &location.path) {
                        collect_text_ids(std::slice::from_ref(item), &mut ids);
                    }
                }
                None => collect_text_ids(&index.binder, &mut ids),
            }
            ids
        };

        let bodies = try_join_all(text_ids.iter().map(|id| self.cache.read(id))).await?;
        Ok(bodies.iter().fold(WordCount::default(), |acc, body| WordCount {
            words: acc.words + body.word_count(),
            chars: acc.chars + body.char_count(),
        }))
    }

    /// A destination must be an active container.
    fn resolve_destination(&self, index: &ProjectIndex, id: &str) -> Result<Location> {
        let location = locate(index, id).ok_or_else(|| StoreError::not_found(id))?;
        if location.container == Container::Trash {
            return Err(StoreError::invalid(format!("{id} is in the trash")));
        }
        let item = item_at(&index.binder, &location.path).ok_or_else(|| StoreError::not_found(id))?;
        if !item.item_type.is_container() {
            return Err(StoreError::invalid(format!(
                "{id} is a {} item and cannot hold children",
                item.item_type
            )));
        }
        Ok(location)
    }
}

fn loaded(index: &Option<ProjectIndex>) -> Result<&ProjectIndex> {
    index
        .as_ref()
        .ok_or_else(|| StoreError::invalid("no project is loaded"))
}

fn loaded_mut(index: &mut Option<ProjectIndex>) -> Result<&mut ProjectIndex> {
    index
        .as_mut()
        .ok_or_else(|| StoreError::invalid("no project is loaded"))
}

fn forest(index: &ProjectIndex, container: Container) -> &Vec<BinderItem> {
    match container {
        Container::Binder => &index.binder,
        Container::Trash => &index.trash,
    }
}

fn forest_mut(index: &mut ProjectIndex, container: Container) -> &mut Vec<BinderItem> {
    match container {
        Container::Binder => &mut index.binder,
        Container::Trash => &mut index.trash,
    }
}

fn locate(index: &ProjectIndex, id: &str) -> Option<Location> {
    [Container::Binder, Container::Trash]
        .into_iter()
        .find_map(|container| {
            path_to(forest(index, container), id).map(|path| Location { container, path })
        })
}

fn path_to(items: &[BinderItem], id: &str) -> Option<Vec<usize>> {
    let mut stack: Vec<(&BinderItem, Vec<usize>)> = items
        .iter()
        .enumerate()
        .rev()
        .map(|(i, item)| (item, vec![i]))
        .collect();
    while let Some((item, path)) = stack.pop() {
        if item.id == id {
            return Some(path);
        }
        for (i, child) in item.children.iter().enumerate().rev() {
            let mut child_path = path.clone();
            child_path.push(i);
            stack.push((child, child_path));
        }
    }
    None
}

fn item_at<'a>(items: &'a [BinderItem], path: &[usize]) -> Option<&'a BinderItem> {
    let (first, rest) = path.split_first()?;
    let mut item = items.get(*first)?;
    for i in rest {
        item = item.children.get(*i)?;
    }
    Some(item)
}

fn item_at_mut<'a>(items: &'a mut [BinderItem], path: &[usize]) -> Option<&'a mut BinderItem> {
    let (first, rest) = path.split_first()?;
    let mut item = items.get_mut(*first)?;
    for i in rest {
        item = item.children.get_mut(*i)?;
    }
    Some(item)
}

fn siblings_mut<'a>(items: &'a mut Vec<BinderItem>, parent: &[usize]) -> Option<&'a mut Vec<BinderItem>> {
    if parent.is_empty() {
        return Some(items);
    }
    item_at_mut(items, parent).map(|p| &mut p.children)
}

fn detach(items: &mut Vec<BinderItem>, path: &[usize]) -> Option<BinderItem> {
    let (last, parent) = path.split_last()?;
    let siblings = siblings_mut(items, parent)?;
    if *last < siblings.len() {
        Some(siblings.remove(*last))
    } else {
        None
    }
}

/// Put a detached item back where it came from.
fn restore(items: &mut Vec<BinderItem>, path: &[usize], item: BinderItem) {
    if let Some((last, parent)) = path.split_last() {
        if let Some(siblings) = siblings_mut(items, parent) {
            let at = (*last).min(siblings.len());
            siblings.insert(at, item);
        }
    }
}

/// Move the item at `from` to the end of the children of `to` (or of the
/// root when `None`), within one forest. `to` must already account for the
/// removal of `from`.
fn transplant(
    items: &mut Vec<BinderItem>,
    from: &[usize],
    to: Option<&[usize]>,
) -> Result<()> {
    let item = detach(items, from).ok_or_else(|| StoreError::invalid("item vanished during move"))?;
    let siblings = match to {
        Some(path) => item_at_mut(items, path).map(|p| &mut p.children),
        None => Some(&mut *items),
    };
    match siblings {
        Some(siblings) => {
            siblings.push(touched(item));
            Ok(())
        }
        None => {
            restore(items, from, item);
            Err(StoreError::invalid("destination vanished during move"))
        }
    }
}

/// Index path of `target` once the item at `removed` is gone from the same forest.
fn shift_after_removal(removed: &[usize], target: &[usize]) -> Vec<usize> {
    let mut adjusted = target.to_vec();
    if let Some((last, parent)) = removed.split_last() {
        let level = parent.len();
        if target.len() > level && target.starts_with(parent) && target[level] > *last {
            adjusted[level] -= 1;
        }
    }
    adjusted
}

fn touched(mut item: BinderItem) -> BinderItem {
    item.touch();
    item
}

/// Levels in the subtree rooted at `item`, counting `item` itself.
fn subtree_height(item: &BinderItem) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(item, 1)];
    while let Some((node, depth)) = stack.pop() {
        deepest = deepest.max(depth);
        stack.extend(node.children.iter().map(|child| (child, depth + 1)));
    }
    deepest
}

fn flatten(items: &[BinderItem], in_trash: bool, out: &mut Vec<FlatItem>) {
    let mut stack: Vec<(&BinderItem, usize, Option<&str>)> =
        items.iter().rev().map(|item| (item, 0, None)).collect();
    while let Some((item, depth, parent)) = stack.pop() {
        out.push(FlatItem {
            id: item.id.clone(),
            title: item.title.clone(),
            item_type: item.item_type,
            depth,
            parent_id: parent.map(str::to_string),
            in_trash,
        });
        stack.extend(
            item.children
                .iter()
                .rev()
                .map(|child| (child, depth + 1, Some(item.id.as_str()))),
        );
    }
}

fn collect_text_ids(items: &[BinderItem], out: &mut Vec<String>) {
    let mut stack: Vec<&BinderItem> = items.iter().rev().collect();
    while let Some(item) = stack.pop() {
        if item.item_type == ItemType::Text {
            out.push(item.id.clone());
        }
        stack.extend(item.children.iter().rev());
    }
}
