//! Node path helpers.
//!
//! Paths are absolute, `/`-separated and never end in a separator (except
//! the root `/`). Segments are non-empty.

use crate::error::{StoreError, StoreResult};

/// The root path.
pub const ROOT: &str = "/";

/// Check that `path` is absolute and has no empty segments.
pub fn validate(path: &str) -> StoreResult<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(StoreError::Config(format!(
            "path '{path}' must start with '/'"
        )));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(StoreError::Config(format!(
            "path '{path}' contains an empty segment"
        )));
    }
    Ok(())
}

/// Join a child name onto a parent path.
pub fn join(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if parent == ROOT || parent.is_empty() {
        format!("/{child}")
    } else {
        format!("{}/{child}", parent.trim_end_matches('/'))
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Segments of `path`, skipping the leading root.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
