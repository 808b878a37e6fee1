//! Archive path normalization and the traversal guard.
//!
//! Entry names coming out of containers are surfaced to callers as-is, but
//! every comparison (list filters, extract lookup) happens on the normalized
//! form: no leading slash, no `.` segments, `..` collapsed lexically. A `..`
//! that cannot be collapsed is kept so [`is_safe`] can reject it.

/// Normalize an archive path for comparison.
///
/// Leading slashes are stripped, `.` segments dropped and `..` segments
/// collapsed against their parent where possible. The result never carries a
/// trailing slash. Normalization is idempotent.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                match parts.last() {
                    Some(&"..") | None => parts.push(".."),
                    Some(_) => {
                        parts.pop();
                    }
                }
            }
            other => parts.push(other),
        }
    }

    parts.join("/")
}

/// Whether a caller-supplied path is safe to hand to a format handler.
///
/// Rejects any path whose normalized form still contains a `..` segment.
pub fn is_safe(path: &str) -> bool {
    normalize(path).split('/').all(|segment| segment != "..")
}

/// The final component of a path, used for `Content-Disposition` filenames.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
}
