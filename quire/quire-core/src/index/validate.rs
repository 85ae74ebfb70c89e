use super::model::{is_valid_id, BinderItem, ProjectIndex};
use crate::config::IndexConfig;
use crate::error::{Result, StoreError};
use std::collections::HashSet;

/// Structural check of a whole index: unique well-formed ids across the
/// binder and the trash, bounded depth, bounded node count.
///
/// The walk is iterative so a pathological index cannot exhaust the stack.
/// Returns the number of nodes visited.
pub fn validate(index: &ProjectIndex, limits: &IndexConfig) -> Result<usize> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&BinderItem, usize)> = Vec::new();

    for (container, items) in [("binder", &index.binder), ("trash", &index.trash)] {
        stack.extend(items.iter().rev().map(|item| (item, 1)));
        while let Some((item, depth)) = stack.pop() {
            if depth > limits.max_depth {
                return Err(StoreError::validation(format!(
                    "{container} item {} sits deeper than {} levels",
                    item.id, limits.max_depth
                )));
            }
            if !is_valid_id(&item.id) {
                return Err(StoreError::validation(format!(
                    "{container} holds an item with unusable id {:?}",
                    item.id
                )));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(StoreError::validation(format!(
                    "item {} appears more than once",
                    item.id
                )));
            }
            if seen.len() > limits.max_nodes {
                return Err(StoreError::validation(format!(
                    "index holds more than {} items",
                    limits.max_nodes
                )));
            }
            stack.extend(item.children.iter().rev().map(|child| (child, depth + 1)));
        }
    }
    Ok(seen.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::model::ItemType;

    fn folder(id: &str, children: Vec<BinderItem>) -> BinderItem {
        BinderItem::new(id, ItemType::Folder, id).with_children(children)
    }

    fn text(id: &str) -> BinderItem {
        BinderItem::new(id, ItemType::Text, id)
    }

    #[test]
    fn accepts_well_formed_index() {
        let mut index = ProjectIndex::new(vec![folder("draft", vec![text("a"), text("b")])]);
        index.trash.push(text("c"));
        assert_eq!(validate(&index, &IndexConfig::default()).unwrap(), 4);
    }

    #[test]
    fn duplicate_across_containers_is_rejected() {
        let mut index = ProjectIndex::new(vec![folder("draft", vec![text("a")])]);
        index.trash.push(text("a"));
        let err = validate(&index, &IndexConfig::default()).unwrap_err();
        assert!(matches!(err, StoreError::Validation(ref m) if m.contains("more than once")));
    }

    #[test]
    fn depth_and_node_ceilings() {
        let mut chain = text("leaf");
        for i in 0..5 {
            chain = folder(&format!("f{i}"), vec![chain]);
        }
        let index = ProjectIndex::new(vec![chain]);
        let shallow = IndexConfig {
            max_depth: 4,
            ..IndexConfig::default()
        };
        assert!(validate(&index, &shallow).is_err());

        let small = IndexConfig {
            max_nodes: 5,
            ..IndexConfig::default()
        };
        assert!(validate(&index, &small).is_err());
        assert_eq!(validate(&index, &IndexConfig::default()).unwrap(), 6);
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let index = ProjectIndex::new(vec![text("../escape")]);
        assert!(validate(&index, &IndexConfig::default()).is_err());
    }
}
