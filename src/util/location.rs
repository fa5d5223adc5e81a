use crate::model::error::{Result, StorageError};

/// Lexically resolves a location into a key relative to a driver root.
///
/// Empty and `.` segments are dropped and `..` pops the previous segment,
/// but never past the root: `../../x` and `/x` both resolve to `x`.
/// Both `/` and `\` separate segments.
pub fn normalize(location: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in location.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    segments.join("/")
}

/// Key of a single object. The root itself never names one.
pub fn object_key(location: &str) -> Result<String> {
    let key = normalize(location);
    if key.is_empty() {
        return Err(StorageError::invalid_input(
            location,
            "location resolves to the storage root",
        ));
    }

    Ok(key)
}

/// Like [`normalize`] but keeps a trailing `/`, which marks a prefix that
/// must only match the contents of that directory.
pub fn normalize_prefix(prefix: &str) -> String {
    let mut key = normalize(prefix);
    if !key.is_empty() && (prefix.ends_with('/') || prefix.ends_with('\\')) {
        key.push('/');
    }
    key
}

/// Deepest directory that can hold matches of a normalized prefix,
/// e.g. `a/b/c` -> `a/b` and `a/b/` -> `a/b`.
pub fn prefix_directory(prefix: &str) -> &str {
    if prefix.ends_with('/') {
        return prefix.trim_end_matches('/');
    }

    match prefix.rfind('/') {
        Some(pos) => &prefix[..pos],
        None => "",
    }
}
