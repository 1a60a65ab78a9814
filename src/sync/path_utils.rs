// Path helpers for mapping entries between the two sync roots
// Relative paths always use '/' and never start with a separator

use std::path::{Component, Path, PathBuf};

/// Normalize a path string so both separator styles become '/'.
pub fn normalize_path_string(path_str: &str) -> String {
    path_str.replace('\\', "/")
}

/// Path of `path` relative to `root`, as a '/'-joined string.
///
/// Returns `None` when `path` is not below `root`, and an empty string for
/// the root itself.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}

/// Resolve a relative sync path against a root.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        path.push(part);
    }
    path
}

/// Split a relative path into its parent and basename.
///
/// Top-level entries have an empty parent.
pub fn split_parent(relative: &str) -> (&str, &str) {
    let trimmed = relative.trim_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}
