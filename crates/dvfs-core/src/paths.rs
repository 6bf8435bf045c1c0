//! POSIX-style absolute path helpers.
//!
//! Store keys are always normalized: a leading `/`, no empty, `.` or `..`
//! components and no trailing slash (except the root itself).

use crate::error::{FsError, FsResult};

pub const ROOT: &str = "/";

/// Normalize an absolute path. `..` may not climb above the root.
pub fn normalize(path: &str) -> FsResult<String> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument);
    }

    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(FsError::InvalidArgument);
                }
            }
            name => components.push(name),
        }
    }

    if components.is_empty() {
        return Ok(ROOT.to_string());
    }
    Ok(format!("/{}", components.join("/")))
}

/// Parent of a normalized path; `None` for the root.
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

/// Last component of a normalized path; empty for the root.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// True when `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT || path == ancestor {
        return true;
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Re-home `path` from under `old_prefix` to under `new_prefix`.
pub fn rebase(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    if !is_within(path, old_prefix) {
        return None;
    }
    let rest = if old_prefix == ROOT {
        &path[1..]
    } else {
        &path[old_prefix.len() + 1..]
    };
    Some(join(new_prefix, rest))
}
