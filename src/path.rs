//! Remote path helpers
//!
//! Share paths are always absolute from the share root, `/`-separated, without
//! trailing slashes, `.` segments or duplicate separators.

use crate::error::{OpsError, Result};

/// Normalize a remote path. Backslashes are accepted as separators.
///
/// `..` segments are rejected instead of resolved so a caller can never escape the share root.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(OpsError::InvalidPath {
                    path: path.to_string(),
                })
            }
            s => segments.push(s),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent of a normalized path; `None` for the root
pub fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Join a normalized directory path with a single entry name
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Last segment of a normalized path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("docs").unwrap(), "/docs");
        assert_eq!(normalize("/docs/").unwrap(), "/docs");
        assert_eq!(normalize("//docs//./reports").unwrap(), "/docs/reports");
        assert_eq!(normalize("docs\\reports").unwrap(), "/docs/reports");
        assert!(matches!(
            normalize("/docs/../etc"),
            Err(OpsError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/docs").as_deref(), Some("/"));
        assert_eq!(parent("/docs/reports").as_deref(), Some("/docs"));
    }

    #[test]
    fn test_join_and_file_name() {
        assert_eq!(join("/", "a.txt"), "/a.txt");
        assert_eq!(join("/docs", "a.txt"), "/docs/a.txt");
        assert_eq!(file_name("/docs/a.txt"), "a.txt");
        assert_eq!(file_name("/"), "");
    }
}
