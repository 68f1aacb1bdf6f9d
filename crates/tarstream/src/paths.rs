//! Lexical path helpers shared by packing and unpacking.

use std::path::{Component, Path, PathBuf};

/// Split any absolute root off `path`.
///
/// Repeated roots are all removed, so `//a` and `c:/d:/a` both yield `a`.
/// Returns the removed root (empty if the path was relative) and the rest.
pub(crate) fn strip_absolute(path: &str) -> (&str, &str) {
    let mut rest = path;
    loop {
        let trimmed = rest.trim_start_matches('/');
        if trimmed.len() != rest.len() {
            rest = trimmed;
            continue;
        }
        let bytes = rest.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            rest = &rest[2..];
            continue;
        }
        break;
    }
    (&path[..path.len() - rest.len()], rest)
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// `..` at the root stays at the root.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Split an archive path on `/`, dropping empty and `.` components.
pub(crate) fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}
