//! Incremental publish planning.
//!
//! Byte length is the only equality test: an edit that keeps the file size
//! unchanged is not detected. No content hashing is performed.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::crawler::RemoteFileRecord;
use super::local_walker::LocalFileRef;
use super::paths::{PathError, local_relative_path};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("failed to read size of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDecision {
    pub local_path: PathBuf,
    pub relative_path: String,
    pub upload: bool,
}

/// One decision per local path, in input order.
pub fn plan(
    local_paths: &[PathBuf],
    remote: &[RemoteFileRecord],
    root: &Path,
) -> Result<Vec<UploadDecision>, PlanError> {
    let remote_lengths: HashMap<&str, u64> = remote
        .iter()
        .map(|record| (record.relative_path.as_str(), record.length))
        .collect();

    local_paths
        .iter()
        .map(|path| {
            let relative_path = local_relative_path(root, path)?;
            let upload = match remote_lengths.get(relative_path.as_str()) {
                Some(remote_len) => {
                    let file = LocalFileRef::new(path.clone());
                    let local_len = file.len().map_err(|source| PlanError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    local_len != *remote_len
                }
                None => true,
            };
            Ok(UploadDecision {
                local_path: path.clone(),
                relative_path,
                upload,
            })
        })
        .collect()
}

/// Remote records with no local counterpart.
pub fn orphans<'a>(
    local_paths: &[PathBuf],
    remote: &'a [RemoteFileRecord],
    root: &Path,
) -> Result<Vec<&'a RemoteFileRecord>, PlanError> {
    let local: HashSet<String> = local_paths
        .iter()
        .map(|path| local_relative_path(root, path))
        .collect::<Result<_, _>>()?;
    Ok(remote
        .iter()
        .filter(|record| !local.contains(&record.relative_path))
        .collect())
}
