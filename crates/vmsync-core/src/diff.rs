//! Keyed set difference between two sub-resource collections.

use crate::error::{CoreError, Result};
use std::collections::{HashMap, HashSet};

/// An item that can be matched across two collections by identity key.
pub trait Keyed: Clone + PartialEq {
    /// Server-assigned identifier, if any.
    fn key(&self) -> Option<&str>;

    /// Copy used for comparison.
    ///
    /// Blank strings and absent values must compare equal, and fields the
    /// server fills in on its own must be cleared.
    fn normalized(&self) -> Self {
        self.clone()
    }

    /// Copy of `self` with the fields it leaves unset taken from `current`,
    /// the item with the same key in the old collection.
    fn merged_onto(&self, _current: &Self) -> Self {
        self.clone()
    }
}

fn effective_key<T: Keyed>(item: &T) -> Option<&str> {
    item.key().filter(|k| !k.trim().is_empty())
}

/// Result of comparing an old and a new collection.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult<T> {
    /// Items in `new` without a matching key in `old`, in `new` order
    pub added: Vec<T>,
    /// Items in `old` without a matching key in `new`, in `old` order
    pub removed: Vec<T>,
    /// Items of `new` whose key matches but whose value differs, in `new`
    /// order, completed with the fields they leave unset
    pub updated: Vec<T>,
}

impl<T> Default for DiffResult<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            updated: Vec::new(),
        }
    }
}

impl<T> DiffResult<T> {
    /// True if no operation is needed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Number of operations this diff implies.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.updated.len()
    }
}

/// Compute the operations that turn `old` into `new`.
///
/// Items without a key are always added, even when two of them look the
/// same. Keyed items present on both sides are merged onto their old
/// counterpart, compared after normalization and emitted as updated only
/// if they differ.
pub fn diff<T: Keyed>(old: &[T], new: &[T]) -> DiffResult<T> {
    let old_by_key: HashMap<&str, &T> = old
        .iter()
        .filter_map(|item| effective_key(item).map(|k| (k, item)))
        .collect();
    let new_keys: HashSet<&str> = new.iter().filter_map(effective_key).collect();

    let mut result = DiffResult::default();

    for item in new {
        match effective_key(item).and_then(|k| old_by_key.get(k)) {
            None => result.added.push(item.clone()),
            Some(existing) => {
                let merged = item.merged_onto(existing);
                if existing.normalized() != merged.normalized() {
                    result.updated.push(merged);
                }
            }
        }
    }

    for item in old {
        match effective_key(item) {
            Some(k) if new_keys.contains(k) => {}
            _ => result.removed.push(item.clone()),
        }
    }

    result
}

/// Reject a collection in which two items share an identity key.
pub fn validate_unique_keys<T: Keyed>(collection: &str, items: &[T]) -> Result<()> {
    let mut seen = HashSet::new();
    for key in items.iter().filter_map(effective_key) {
        if !seen.insert(key) {
            return Err(CoreError::Validation(format!(
                "{collection}: duplicate ext_id {key:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: Option<String>,
        size: i64,
    }

    impl Keyed for Item {
        fn key(&self) -> Option<&str> {
            self.id.as_deref()
        }
    }

    fn keyed(id: &str, size: i64) -> Item {
        Item {
            id: Some(id.to_string()),
            size,
        }
    }

    fn unkeyed(size: i64) -> Item {
        Item { id: None, size }
    }

    #[test]
    fn test_diff_update_and_add() {
        let old = vec![keyed("1", 10)];
        let new = vec![keyed("1", 20), keyed("2", 5)];

        let result = diff(&old, &new);
        assert_eq!(result.added, vec![keyed("2", 5)]);
        assert!(result.removed.is_empty());
        assert_eq!(result.updated, vec![keyed("1", 20)]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_diff_remove() {
        let old = vec![keyed("1", 10)];
        let result = diff(&old, &[]);

        assert_eq!(result.removed, vec![keyed("1", 10)]);
        assert!(result.added.is_empty());
        assert!(result.updated.is_empty());
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let items = vec![keyed("1", 10), keyed("2", 20), keyed("3", 30)];
        assert!(diff(&items, &items).is_empty());
    }

    #[test]
    fn test_diff_unkeyed_duplicates_are_independent() {
        let new = vec![unkeyed(5), unkeyed(5)];
        let result = diff(&[], &new);
        assert_eq!(result.added, new);
    }

    #[test]
    fn test_diff_unkeyed_items_never_match_old() {
        let old = vec![unkeyed(5)];
        let new = vec![unkeyed(5)];
        let result = diff(&old, &new);
        assert_eq!(result.added, vec![unkeyed(5)]);
        assert_eq!(result.removed, vec![unkeyed(5)]);
        assert!(result.updated.is_empty());
    }

    #[test]
    fn test_diff_blank_key_treated_as_absent() {
        let old = vec![keyed("", 1)];
        let new = vec![keyed("", 1)];
        let result = diff(&old, &new);
        assert_eq!(result.added.len(), 1);
        assert_eq!(result.removed.len(), 1);
    }

    #[test]
    fn test_diff_partitions_every_item() {
        let old = vec![keyed("a", 1), keyed("b", 2), keyed("c", 3)];
        let new = vec![keyed("c", 3), keyed("b", 9), keyed("d", 4), unkeyed(7)];

        let result = diff(&old, &new);
        assert_eq!(result.added, vec![keyed("d", 4), unkeyed(7)]);
        assert_eq!(result.removed, vec![keyed("a", 1)]);
        assert_eq!(result.updated, vec![keyed("b", 9)]);

        for item in &result.added {
            assert!(!result.removed.contains(item));
        }
        // "c" is unchanged and appears nowhere
        let all: Vec<_> = result
            .added
            .iter()
            .chain(&result.removed)
            .chain(&result.updated)
            .collect();
        assert!(!all.iter().any(|i| i.id.as_deref() == Some("c")));
    }

    #[test]
    fn test_diff_preserves_order() {
        let old = vec![keyed("z", 1), keyed("y", 1), keyed("x", 1)];
        let new = vec![keyed("q", 1), keyed("p", 1)];

        let result = diff(&old, &new);
        let removed: Vec<_> = result.removed.iter().map(|i| i.key()).collect();
        let added: Vec<_> = result.added.iter().map(|i| i.key()).collect();
        assert_eq!(removed, vec![Some("z"), Some("y"), Some("x")]);
        assert_eq!(added, vec![Some("q"), Some("p")]);
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Volume {
        id: String,
        size: Option<i64>,
        tier: Option<String>,
    }

    impl Keyed for Volume {
        fn key(&self) -> Option<&str> {
            Some(&self.id)
        }

        fn merged_onto(&self, current: &Self) -> Self {
            Volume {
                id: self.id.clone(),
                size: self.size.or(current.size),
                tier: self.tier.clone().or_else(|| current.tier.clone()),
            }
        }
    }

    #[test]
    fn test_diff_unset_fields_keep_current_values() {
        let old = vec![Volume {
            id: "v".into(),
            size: Some(10),
            tier: Some("gold".into()),
        }];

        let unspecified = vec![Volume {
            id: "v".into(),
            size: None,
            tier: None,
        }];
        assert!(diff(&old, &unspecified).is_empty());

        let resized = vec![Volume {
            id: "v".into(),
            size: Some(20),
            tier: None,
        }];
        let result = diff(&old, &resized);
        assert_eq!(
            result.updated,
            vec![Volume {
                id: "v".into(),
                size: Some(20),
                tier: Some("gold".into()),
            }]
        );
    }

    #[test]
    fn test_validate_unique_keys() {
        assert!(validate_unique_keys("disks", &[keyed("1", 1), keyed("2", 1), unkeyed(1)]).is_ok());
        assert!(validate_unique_keys("disks", &[unkeyed(1), unkeyed(1)]).is_ok());

        let err = validate_unique_keys("disks", &[keyed("1", 1), keyed("1", 2)]).unwrap_err();
        assert!(matches!(err, CoreError::Validation(msg) if msg.contains("\"1\"")));
    }
}
