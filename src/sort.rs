//! Presentation order of listing items.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::types::{Entry, ListItem};

/// Field a listing is ordered by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    Name,
    Permission,
    Size,
    Mtime,
    Ctime,
    Atime,
}

/// Case-insensitive comparison with an exact comparison as tiebreak.
///
/// Lowercasing is not locale collation: accented names order by code point,
/// so `Émile` sorts after `zoe` rather than next to `emile`.
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

fn compare_key(a: &Entry, b: &Entry, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => compare_names(&a.name, &b.name),
        SortKey::Permission => a.permission.cmp(&b.permission),
        SortKey::Size => a.size.cmp(&b.size),
        // Option orders missing timestamps first
        SortKey::Mtime => a.mtime.cmp(&b.mtime),
        SortKey::Ctime => a.ctime.cmp(&b.ctime),
        SortKey::Atime => a.atime.cmp(&b.atime),
    }
}

/// Total order over entries: non-files first, then `key`, then name.
///
/// `descending` reverses the whole result, bucket order included.
pub fn compare(a: &Entry, b: &Entry, key: SortKey, descending: bool) -> Ordering {
    let result = a
        .is_file()
        .cmp(&b.is_file())
        .then_with(|| compare_key(a, b, key))
        .then_with(|| compare_names(&a.name, &b.name));
    if descending { result.reverse() } else { result }
}

/// Returns a sorted copy of `items`
pub fn sort_items(items: &[ListItem], key: SortKey, descending: bool) -> Vec<ListItem> {
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| compare(&a.entry, &b.entry, key, descending));
    sorted
}
