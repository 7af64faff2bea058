//! Path helpers for transfers
//!
//! Remote SFTP paths always use `/`; local paths go through `std::path`.

use std::path::Path;

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Split a remote path into `(parent, file name)`.
pub fn split_remote_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// `file.txt` + 2 → `file (2).txt`
///
/// The extension is whatever follows the last dot; a leading dot (`.bashrc`)
/// is part of the stem.
pub fn numbered_file_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Candidate number `n` for a remote destination.
pub fn numbered_remote_path(path: &str, n: u32) -> String {
    let (parent, name) = split_remote_path(path);
    join_remote_path(parent, &numbered_file_name(name, n))
}

/// Candidate number `n` for a local destination.
pub fn numbered_local_path(path: &str, n: u32) -> String {
    let p = Path::new(path);
    let name = p
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    p.with_file_name(numbered_file_name(&name, n))
        .to_string_lossy()
        .to_string()
}

/// Last path component, for display.
pub fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| split_remote_path(path).1.to_string())
}
