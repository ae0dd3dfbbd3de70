use std::path::{Path, PathBuf};

use sprest_core::SpError;
use thiserror::Error;
use tracing::{info, warn};

use super::paths::{PathError, remote_target};
use super::remote::{DeleteOutcome, FileDeleter};

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("failed to delete {path}: {source}")]
    Remote {
        path: String,
        #[source]
        source: SpError,
    },
}

/// Mirrors local deletions to the remote tree.
///
/// Deletes are neither debounced nor ordered against uploads of the same
/// path. A delete followed by an immediate recreate may race with the
/// resulting upload.
pub struct DeletePropagator<D> {
    deleter: D,
    local_root: PathBuf,
    remote_root: String,
}

impl<D: FileDeleter> DeletePropagator<D> {
    pub fn new(deleter: D, local_root: PathBuf, remote_root: &str) -> Self {
        Self {
            deleter,
            local_root,
            remote_root: remote_root.to_string(),
        }
    }

    pub fn remote_path_for(&self, local_path: &Path) -> Result<String, PathError> {
        Ok(remote_target(&self.remote_root, &self.local_root, local_path)?.path())
    }

    /// A target that is already gone counts as success.
    pub async fn on_delete(&self, local_path: &Path) -> Result<DeleteOutcome, DeleteError> {
        let remote = self.remote_path_for(local_path)?;
        self.delete_remote(&remote).await
    }

    /// Deletes remote paths one at a time. Failures are logged and skipped;
    /// returns how many paths were removed or already absent.
    pub async fn delete_queue(&self, remote_paths: &[String]) -> usize {
        let mut done = 0;
        for remote in remote_paths {
            match self.delete_remote(remote).await {
                Ok(_) => done += 1,
                Err(err) => warn!(error = %err, "delete skipped"),
            }
        }
        done
    }

    async fn delete_remote(&self, remote: &str) -> Result<DeleteOutcome, DeleteError> {
        match self.deleter.delete_file(remote).await {
            Ok(DeleteOutcome::Deleted) => {
                info!(remote = %remote, "deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Ok(DeleteOutcome::AlreadyAbsent) => {
                info!(remote = %remote, "already absent, nothing to delete");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(err) if err.is_not_found() => {
                info!(remote = %remote, "already absent, nothing to delete");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(source) => Err(DeleteError::Remote {
                path: remote.to_string(),
                source,
            }),
        }
    }
}
