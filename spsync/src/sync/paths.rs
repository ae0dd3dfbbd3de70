use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not under the local root: {0}")]
    OutsideRoot(String),
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path has no file name: {0}")]
    NoFileName(String),
}

/// Where a local file lands on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub folder: String,
    pub file_name: String,
}

impl RemoteTarget {
    pub fn path(&self) -> String {
        join_remote(&self.folder, &self.file_name)
    }
}

/// Server-relative form: forward slashes, single leading slash, no doubled or
/// trailing slashes.
pub fn normalize_remote_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect();
    format!("/{}", parts.join("/"))
}

pub fn join_remote(root: &str, relative: &str) -> String {
    normalize_remote_path(&format!("{root}/{relative}"))
}

/// Strips `root` from a remote path; `None` when the path is not below it.
/// Server-relative URLs are case-insensitive, so the prefix is matched with
/// ASCII case folding and the remainder keeps the path's own casing.
pub fn relative_remote_path(root: &str, path: &str) -> Option<String> {
    let root = normalize_remote_path(root);
    let path = normalize_remote_path(path);
    if root == "/" {
        return Some(path.trim_start_matches('/').to_string());
    }
    let prefix = path.get(..root.len())?;
    if !prefix.eq_ignore_ascii_case(&root) {
        return None;
    }
    path[root.len()..].strip_prefix('/').map(str::to_string)
}

/// Root-relative path of a local file, always joined with `/`.
pub fn local_relative_path(root: &Path, path: &Path) -> Result<String, PathError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(path.display().to_string()))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.display().to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::NoFileName(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

pub fn remote_target(
    remote_root: &str,
    local_root: &Path,
    local_path: &Path,
) -> Result<RemoteTarget, PathError> {
    let relative = local_relative_path(local_root, local_path)?;
    let full = join_remote(remote_root, &relative);
    let (folder, file_name) = split_remote(&full);
    Ok(RemoteTarget {
        folder: folder.to_string(),
        file_name: file_name.to_string(),
    })
}

/// Local destination of a remote file given its root-relative path.
pub fn local_target(local_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let mut target = local_root.to_path_buf();
    let mut segments = 0;
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') {
            return Err(PathError::UnsupportedComponent(relative.to_string()));
        }
        target.push(segment);
        segments += 1;
    }
    if segments == 0 {
        return Err(PathError::NoFileName(relative.to_string()));
    }
    Ok(target)
}

/// Splits a normalized remote path into its parent folder and final segment.
pub fn split_remote(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}
