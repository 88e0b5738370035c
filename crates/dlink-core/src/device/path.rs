//! Helpers for device-side paths.
//!
//! Device paths are plain `/`-separated strings rooted at `/`. They never touch the
//! host filesystem, so `std::path` is deliberately not used here.

/// Normalizes a device path.
///
/// Empty and "." map to "/", a leading "/" is added when missing, and trailing
/// slashes are stripped (except for the root itself).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Returns the normalized parent directory. The root is its own parent.
pub fn parent_path(path: &str) -> String {
    let normalized = normalize_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => normalized[..index].to_string(),
    }
}

/// Returns the last path component, or `None` for the root.
pub fn file_name(path: &str) -> Option<&str> {
    path.trim_end_matches('/').rsplit('/').next().filter(|name| !name.is_empty())
}

/// Joins a directory and an entry name.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root_forms() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("."), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//"), "/");
    }

    #[test]
    fn test_normalize_path_relative() {
        assert_eq!(normalize_path("docs"), "/docs");
        assert_eq!(normalize_path("docs/math"), "/docs/math");
    }

    #[test]
    fn test_normalize_path_trailing_slash() {
        assert_eq!(normalize_path("/docs/"), "/docs");
        assert_eq!(normalize_path("docs/"), "/docs");
    }

    #[test]
    fn test_normalize_path_keeps_spaces() {
        assert_eq!(normalize_path("/My Documents"), "/My Documents");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/docs/a.tns"), "/docs");
        assert_eq!(parent_path("/docs"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(parent_path("docs/new/"), "/docs");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/docs/a.tns"), Some("a.tns"));
        assert_eq!(file_name("/docs/"), Some("docs"));
        assert_eq!(file_name("a.tns"), Some("a.tns"));
        assert_eq!(file_name("/"), None);
        assert_eq!(file_name(""), None);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a.tns"), "/a.tns");
        assert_eq!(join_path("", "a.tns"), "/a.tns");
        assert_eq!(join_path("/docs/", "a.tns"), "/docs/a.tns");
    }
}
