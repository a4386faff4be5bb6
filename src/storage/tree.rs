// ============================================================================
// COLLECTION TREE
// ============================================================================
// Collection forest used by navigation menus.
// ============================================================================

use std::cmp::Ordering;

use serde::Serialize;
use uuid::Uuid;

use super::{Collection, Library, Store};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeEntry {
    pub id: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub children: Vec<TreeEntry>,
}

pub type CollectionTree = Vec<TreeEntry>;

impl Store {
    /// Forest of non-template collections below `root` (top-level ones when
    /// `None`). `root` may be an identifier or an alias.
    pub fn collection_tree(&self, root: Option<&str>) -> StorageResult<CollectionTree> {
        self.read(|library| {
            let root = match root.filter(|r| !r.is_empty()) {
                None => None,
                Some(value) => Some(resolve_root(library, value)?),
            };
            Ok(children(library, root.as_deref()))
        })
    }
}

fn resolve_root(library: &Library, value: &str) -> StorageResult<String> {
    if let Ok(id) = Uuid::parse_str(value) {
        let id = id.to_string();
        return if library.collections.contains_key(&id) {
            Ok(id)
        } else {
            Err(StorageError::NotFound)
        };
    }

    library
        .collections
        .values()
        .find(|c| c.alias.as_deref() == Some(value))
        .map(|c| c.item.id.clone())
        .ok_or_else(|| StorageError::InvalidAlias {
            alias: value.to_string(),
        })
}

fn label(collection: &Collection) -> String {
    collection
        .title()
        .map(str::to_string)
        .unwrap_or_else(|| collection.item.name.clone())
}

fn children(library: &Library, parent: Option<&str>) -> Vec<TreeEntry> {
    let mut entries: Vec<TreeEntry> = library
        .collections
        .values()
        .filter(|c| !c.template && c.parent_id() == parent)
        .map(|c| TreeEntry {
            id: c.item.id.clone(),
            label: label(c),
            parent: c.parent_id().map(str::to_string),
            children: children(library, Some(&c.item.id)),
        })
        .collect();

    entries.sort_by(|a, b| natural_cmp(&a.label, &b.label));
    entries
}

/// Case-insensitive comparison treating digit runs as numbers, so that
/// `host2` sorts before `host10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let x = take_number(&mut left);
                let y = take_number(&mut right);
                let ordering = x
                    .trim_start_matches('0')
                    .len()
                    .cmp(&y.trim_start_matches('0').len())
                    .then_with(|| x.trim_start_matches('0').cmp(y.trim_start_matches('0')));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(x), Some(y)) => {
                let ordering = x.to_lowercase().cmp(y.to_lowercase());
                if ordering != Ordering::Equal {
                    return ordering;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut number = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        number.push(c);
    }
    number
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Item;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("host2", "host10", Ordering::Less)]
    #[case("Alpha", "beta", Ordering::Less)]
    #[case("a", "a1", Ordering::Less)]
    #[case("v1.10", "v1.9", Ordering::Greater)]
    #[case("same", "same", Ordering::Equal)]
    fn test_natural_cmp(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(natural_cmp(a, b), expected);
    }

    #[test]
    fn test_collection_tree() {
        let store = Store::memory();
        let root = store
            .save(Collection {
                item: Item::named("root"),
                alias: Some("root-alias".into()),
                ..Default::default()
            })
            .unwrap();
        for name in ["host10", "host2"] {
            store
                .save(Collection {
                    item: Item::named(name),
                    parent: Some(root.item.id.clone()),
                    ..Default::default()
                })
                .unwrap();
        }
        store
            .save(Collection {
                item: Item::named("titled"),
                options: serde_json::from_value(json!({"title": "Zeta"})).unwrap(),
                ..Default::default()
            })
            .unwrap();
        store
            .save(Collection {
                item: Item::named("template"),
                template: true,
                ..Default::default()
            })
            .unwrap();

        let tree = store.collection_tree(None).unwrap();
        let labels: Vec<&str> = tree.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["root", "Zeta"]);

        let children: Vec<&str> = tree[0].children.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(children, vec!["host2", "host10"]);
        assert_eq!(tree[0].children[0].parent.as_deref(), Some(root.item.id.as_str()));

        let subtree = store.collection_tree(Some("root-alias")).unwrap();
        assert_eq!(subtree.len(), 2);

        assert!(matches!(
            store.collection_tree(Some("unknown")),
            Err(StorageError::InvalidAlias { .. })
        ));
    }
}
