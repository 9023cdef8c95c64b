//! Path helpers

use std::path::{Path, PathBuf};

use crate::Result;

/// Validate and canonicalize a path
///
/// Resolves symlinks and `..` segments so that two spellings of the same
/// file map to one identity.
pub fn validate_and_canonicalize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();

    let canonical_path = path.canonicalize().map_err(|_| {
        crate::Error::InvalidPath(format!("Invalid or non-existent path: {}", path.display()))
    })?;

    // Ensure it's absolute (canonicalize returns absolute path)
    if !canonical_path.is_absolute() {
        return Err(crate::Error::InvalidPath("Path must be absolute".to_string()));
    }

    Ok(canonical_path)
}

/// Render an absolute path as a `file://` URI, percent-encoding as needed
pub fn path_to_file_uri(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let mut uri = String::with_capacity(raw.len() + 8);
    uri.push_str("file://");
    // Windows drive paths need the extra slash: file:///C:/...
    if !raw.starts_with('/') {
        uri.push('/');
    }

    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                uri.push(byte as char)
            }
            other => uri.push_str(&format!("%{:02X}", other)),
        }
    }
    uri
}
