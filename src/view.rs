//! Derived views over the latest snapshot. Everything here is pure and cheap
//! enough to recompute on every read.

use serde::Serialize;

use crate::sort::SortKey;

const SIZE_UNITS: [&str; 4] = [" B", " KB", " MB", " GB"];

/// One element of the navigation trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    /// Absolute path this crumb navigates to
    pub key: String,
    pub text: String,
    pub is_current: bool,
}

/// Trail from the device root to `path`; the last crumb is the current one
pub fn breadcrumbs(path: &str) -> Vec<Breadcrumb> {
    let mut crumbs = vec![Breadcrumb {
        key: "/".to_string(),
        text: "Device".to_string(),
        is_current: false,
    }];
    let mut key = String::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        key.push('/');
        key.push_str(segment);
        crumbs.push(Breadcrumb {
            key: key.clone(),
            text: segment.to_string(),
            is_current: false,
        });
    }
    if let Some(last) = crumbs.last_mut() {
        last.is_current = true;
    }
    crumbs
}

/// Column ordering chosen by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SortState {
    pub key: SortKey,
    pub descending: bool,
}

impl SortState {
    /// Clicking the active column flips direction, another column starts ascending
    pub fn toggle(&mut self, key: SortKey) {
        if self.key == key {
            self.descending = !self.descending;
        } else {
            self.key = key;
            self.descending = false;
        }
    }
}

/// Human readable size with up to two decimals, for example `1.5 KB`
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut index = 0;
    while index < SIZE_UNITS.len() - 1 && value > 1024.0 {
        index += 1;
        value /= 1024.0;
    }
    let formatted = format!("{value:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{}", SIZE_UNITS[index])
}

/// `12 KB of 1 MB (3 KB/s)`, or `None` for an empty transfer
pub fn format_speed(completed: u64, total: u64, speed: u64) -> Option<String> {
    if total == 0 {
        return None;
    }
    Some(format!(
        "{} of {} ({}/s)",
        format_size(completed),
        format_size(total),
        format_size(speed)
    ))
}

/// `ls -l` style permission triplets, for example `rwxr-x---`
pub fn permission_string(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}
