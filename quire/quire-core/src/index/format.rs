//! Mapping between [`ProjectIndex`] and the XML element tree.
//!
//! ```text
//! <QuireProject Version="1">
//!   <Binder>
//!     <BinderItem ID=".." Type="Folder" Created=".." Modified="..">
//!       <Title>Draft</Title>
//!       <MetaData>
//!         <Synopsis/> <Notes/> <Keywords><Keyword/></Keywords>
//!         <Custom><Field Key=".."/></Custom>
//!       </MetaData>
//!       <Children>..</Children>
//!     </BinderItem>
//!   </Binder>
//!   <SearchResults>..trash..</SearchResults>
//! </QuireProject>
//! ```

use super::model::{timestamp, BinderItem, ItemMetadata, ItemType, ProjectIndex};
use super::xml::Element;
use crate::config::IndexConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

pub const ROOT: &str = "QuireProject";
pub const BINDER: &str = "Binder";
pub const TRASH: &str = "SearchResults";
const ITEM: &str = "BinderItem";
const CHILDREN: &str = "Children";
const FORMAT_VERSION: &str = "1";

pub fn index_to_element(index: &ProjectIndex, limits: &IndexConfig) -> Element {
    let container = |name: &str, items: &[BinderItem]| {
        let mut el = Element::new(name);
        el.children = items.iter().map(|item| item_to_element(item, limits)).collect();
        el
    };
    Element::new(ROOT)
        .with_attr("Version", FORMAT_VERSION)
        .with_child(container(BINDER, &index.binder))
        .with_child(container(TRASH, &index.trash))
}

fn item_to_element(item: &BinderItem, limits: &IndexConfig) -> Element {
    let mut el = Element::new(ITEM)
        .with_attr("ID", sanitize_text(&item.id))
        .with_attr("Type", item.item_type.as_str())
        .with_attr("Created", format_time(item.created))
        .with_attr("Modified", format_time(item.modified))
        .with_child(Element::new("Title").with_text(sanitize_title(&item.title, limits.max_title_len)));

    if !item.metadata.is_empty() {
        el.children.push(metadata_to_element(&item.metadata));
    }
    if !item.children.is_empty() {
        let mut children = Element::new(CHILDREN);
        children.children = item
            .children
            .iter()
            .map(|child| item_to_element(child, limits))
            .collect();
        el.children.push(children);
    }
    el
}

fn metadata_to_element(meta: &ItemMetadata) -> Element {
    let mut el = Element::new("MetaData");
    if !meta.synopsis.is_empty() {
        el.children
            .push(Element::new("Synopsis").with_text(sanitize_text(&meta.synopsis)));
    }
    if !meta.notes.is_empty() {
        el.children.push(Element::new("Notes").with_text(sanitize_text(&meta.notes)));
    }
    if !meta.keywords.is_empty() {
        let mut keywords = Element::new("Keywords");
        keywords.children = meta
            .keywords
            .iter()
            .map(|k| Element::new("Keyword").with_text(sanitize_text(k)))
            .collect();
        el.children.push(keywords);
    }
    if !meta.custom.is_empty() {
        let mut custom = Element::new("Custom");
        custom.children = meta
            .custom
            .iter()
            .map(|(k, v)| {
                Element::new("Field")
                    .with_attr("Key", sanitize_text(k))
                    .with_text(sanitize_text(v))
            })
            .collect();
        el.children.push(custom);
    }
    el
}

/// Build a [`ProjectIndex`] from a parsed element tree.
///
/// Per-node checks (id present, type whitelisted, depth and node-count
/// ceilings) run while converting the parsed elements, so a hostile document
/// is rejected before any [`BinderItem`] beyond the ceiling is built. Element
/// nesting is already bounded during parsing. Cross-node checks live in
/// [`super::validate`].
pub fn index_from_element(root: &Element, limits: &IndexConfig) -> Result<ProjectIndex> {
    if root.name != ROOT {
        return Err(StoreError::validation(format!(
            "expected <{ROOT}> root element, found <{}>",
            root.name
        )));
    }
    let binder = root
        .child(BINDER)
        .ok_or_else(|| StoreError::validation(format!("missing <{BINDER}> container")))?;

    let mut seen = 0usize;
    let mut index = ProjectIndex::default();
    index.binder = items_from(binder, 1, &mut seen, limits)?;
    // A project that never trashed anything may omit the trash container.
    if let Some(trash) = root.child(TRASH) {
        index.trash = items_from(trash, 1, &mut seen, limits)?;
    }
    Ok(index)
}

fn items_from(
    container: &Element,
    depth: usize,
    seen: &mut usize,
    limits: &IndexConfig,
) -> Result<Vec<BinderItem>> {
    container
        .children_named(ITEM)
        .map(|el| item_from(el, depth, seen, limits))
        .collect()
}

fn item_from(
    el: &Element,
    depth: usize,
    seen: &mut usize,
    limits: &IndexConfig,
) -> Result<BinderItem> {
    *seen += 1;
    if *seen > limits.max_nodes {
        return Err(StoreError::validation(format!(
            "index holds more than {} items",
            limits.max_nodes
        )));
    }
    if depth > limits.max_depth {
        return Err(StoreError::validation(format!(
            "items nested deeper than {} levels",
            limits.max_depth
        )));
    }

    let id = el.attr("ID").map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return Err(StoreError::validation("binder item without an ID"));
    }
    let raw_type = el.attr("Type").unwrap_or_default();
    let item_type = ItemType::parse(raw_type).ok_or_else(|| {
        StoreError::validation(format!("item {id} has unsupported type {raw_type:?}"))
    })?;

    let children = match el.child(CHILDREN) {
        Some(children) => items_from(children, depth + 1, seen, limits)?,
        None => Vec::new(),
    };

    Ok(BinderItem {
        id: id.to_string(),
        item_type,
        title: el
            .child("Title")
            .map(|t| sanitize_title(&t.text, limits.max_title_len))
            .unwrap_or_default(),
        metadata: el.child("MetaData").map(metadata_from).unwrap_or_default(),
        created: parse_time(el.attr("Created"), id),
        modified: parse_time(el.attr("Modified"), id),
        children,
    })
}

fn metadata_from(el: &Element) -> ItemMetadata {
    let text_of = |name: &str| el.child(name).map(|c| c.text.clone()).unwrap_or_default();
    ItemMetadata {
        synopsis: text_of("Synopsis"),
        notes: text_of("Notes"),
        keywords: el
            .child("Keywords")
            .map(|k| k.children_named("Keyword").map(|kw| kw.text.clone()).collect())
            .unwrap_or_default(),
        custom: el
            .child("Custom")
            .map(|c| {
                c.children_named("Field")
                    .filter_map(|f| f.attr("Key").map(|k| (k.to_string(), f.text.clone())))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: Option<&str>, id: &str) -> DateTime<Utc> {
    match raw.map(DateTime::parse_from_rfc3339) {
        Some(Ok(t)) => t.with_timezone(&Utc),
        Some(Err(err)) => {
            debug!(%id, error = %err, "unreadable timestamp, using now");
            timestamp()
        }
        None => timestamp(),
    }
}

/// Drop characters XML 1.0 cannot carry at all (escaping cannot help them).
pub fn sanitize_text(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            matches!(c, '\t' | '\n' | '\r')
                || (c >= '\u{20}' && c != '\u{FFFE}' && c != '\u{FFFF}')
        })
        .collect()
}

/// Titles are single-line and bounded in length.
pub fn sanitize_title(s: &str, max_len: usize) -> String {
    sanitize_text(s)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(max_len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> IndexConfig {
        IndexConfig::default()
    }

    #[test]
    fn sanitizing_strips_unrepresentable_characters() {
        assert_eq!(sanitize_text("a\u{0}b\u{1b}c\td\n"), "abc\td\n");
        assert_eq!(sanitize_title("line one\nline two", 512), "line one line two");
        assert_eq!(sanitize_title("abcdef", 3), "abc");
    }

    #[test]
    fn missing_trash_normalises_to_empty() {
        let root = Element::new(ROOT).with_child(
            Element::new(BINDER).with_child(
                Element::new(ITEM)
                    .with_attr("ID", "a")
                    .with_attr("Type", "Text")
                    .with_child(Element::new("Title").with_text("Opening")),
            ),
        );
        let index = index_from_element(&root, &limits()).unwrap();
        assert_eq!(index.binder.len(), 1);
        assert_eq!(index.binder[0].title, "Opening");
        assert!(index.binder[0].children.is_empty());
        assert!(index.trash.is_empty());
    }

    #[test]
    fn loaded_titles_match_what_a_save_writes() {
        let long = format!("{}\nsecond line", "x".repeat(20));
        let root = Element::new(ROOT).with_child(
            Element::new(BINDER).with_child(
                Element::new(ITEM)
                    .with_attr("ID", "a")
                    .with_attr("Type", "Text")
                    .with_child(Element::new("Title").with_text(long)),
            ),
        );
        let short = IndexConfig {
            max_title_len: 24,
            ..limits()
        };
        let index = index_from_element(&root, &short).unwrap();
        assert_eq!(index.binder[0].title, format!("{} sec", "x".repeat(20)));

        let reloaded = index_from_element(&index_to_element(&index, &short), &short).unwrap();
        assert_eq!(reloaded, index);
    }

    #[test]
    fn unknown_type_and_missing_id_are_rejected() {
        let with_item = |item: Element| {
            Element::new(ROOT).with_child(Element::new(BINDER).with_child(item))
        };
        let bad_type = with_item(Element::new(ITEM).with_attr("ID", "a").with_attr("Type", "Script"));
        assert!(matches!(
            index_from_element(&bad_type, &limits()),
            Err(StoreError::Validation(_))
        ));
        let no_id = with_item(Element::new(ITEM).with_attr("ID", "  ").with_attr("Type", "Text"));
        assert!(matches!(
            index_from_element(&no_id, &limits()),
            Err(StoreError::Validation(_))
        ));
        assert!(index_from_element(&Element::new("Other"), &limits()).is_err());
    }

    #[test]
    fn node_ceiling_aborts_early() {
        let mut binder = Element::new(BINDER);
        for i in 0..5 {
            binder.children.push(
                Element::new(ITEM)
                    .with_attr("ID", format!("n{i}"))
                    .with_attr("Type", "Text"),
            );
        }
        let root = Element::new(ROOT).with_child(binder);
        let tight = IndexConfig {
            max_nodes: 4,
            ..limits()
        };
        assert!(matches!(
            index_from_element(&root, &tight),
            Err(StoreError::Validation(_))
        ));
    }
}
