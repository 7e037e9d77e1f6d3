//! Lexical path helpers for directory-backed transports.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically clean a slash-separated path: collapse repeated separators,
/// drop `.` segments, resolve `..` against preceding segments and strip any
/// trailing slash. An empty result becomes `"."`.
pub(crate) fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Whether `path` is absolute and already in [`clean`] form.
pub(crate) fn is_clean_absolute(path: &str) -> bool {
    path.starts_with('/') && clean(path) == path
}

/// Resolve `path` to an absolute path without symlinks, `.` or `..`.
///
/// The path itself need not exist, but its parent directory must.
pub(crate) fn resolve_fully_explicit(path: &Path) -> io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(resolved) => return Ok(resolved),
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
        Err(_) => {}
    }

    let file_name = match path.components().next_back() {
        Some(Component::Normal(name)) => name.to_os_string(),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot resolve '{}'", path.display()),
            ))
        }
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let parent = std::fs::canonicalize(parent)?;
    Ok(parent.join(file_name))
}

/// The path and each ancestor, most specific first, stopping before `/`.
pub(crate) fn ancestors_excluding_root(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path.to_string();
    while current != "/" && current != "." && !current.is_empty() {
        out.push(current.clone());
        match current.rfind('/') {
            Some(0) => current = "/".to_string(),
            Some(i) => current.truncate(i),
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean() {
        assert_eq!(clean("/double//slashes"), "/double/slashes");
        assert_eq!(clean("/has/./dot"), "/has/dot");
        assert_eq!(clean("/has/dot/../dot"), "/has/dot");
        assert_eq!(clean("/trailing/slash/"), "/trailing/slash");
        assert_eq!(clean("/../x"), "/x");
        assert_eq!(clean("a/../.."), "..");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("/"), "/");
    }

    #[test]
    fn test_is_clean_absolute() {
        assert!(is_clean_absolute("/etc"));
        assert!(is_clean_absolute("/"));
        assert!(!is_clean_absolute("relative/path"));
        assert!(!is_clean_absolute("/etc/"));
        assert!(!is_clean_absolute("/a//b"));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors_excluding_root("/a/b/c"), vec!["/a/b/c", "/a/b", "/a"]);
        assert!(ancestors_excluding_root("/").is_empty());
    }

    #[test]
    fn test_resolve_fully_explicit() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = std::fs::canonicalize(dir.path()).unwrap();

        assert_eq!(resolve_fully_explicit(dir.path()).unwrap(), base);
        assert_eq!(
            resolve_fully_explicit(&dir.path().join("missing")).unwrap(),
            base.join("missing")
        );
        assert!(resolve_fully_explicit(&dir.path().join("sub/..")).is_err());
        assert!(resolve_fully_explicit(&dir.path().join("no/parent")).is_err());
    }
}
