use sprest_core::SpError;
use thiserror::Error;
use tracing::debug;

use super::paths::{normalize_remote_path, relative_remote_path};
use super::remote::FolderLister;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("listing {path} failed: {source}")]
    Listing {
        path: String,
        #[source]
        source: SpError,
    },
    #[error("remote item {path} is outside crawl root {root}")]
    OutsideRoot { path: String, root: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRecord {
    pub path: String,
    pub relative_path: String,
    pub length: u64,
}

#[derive(Debug)]
struct RemoteFolderTask {
    path: String,
    processed: bool,
}

/// Breadth-first enumeration of a remote folder tree, one listing call per
/// non-empty folder.
pub struct RemoteTreeCrawler<'a, L> {
    lister: &'a L,
}

impl<'a, L: FolderLister> RemoteTreeCrawler<'a, L> {
    pub fn new(lister: &'a L) -> Self {
        Self { lister }
    }

    /// Any listing failure aborts the crawl; a partial inventory is never
    /// returned.
    pub async fn crawl(&self, root: &str) -> Result<Vec<RemoteFileRecord>, CrawlError> {
        let root = normalize_remote_path(root);
        let mut tasks = vec![RemoteFolderTask {
            path: root.clone(),
            processed: false,
        }];
        let mut files = Vec::new();
        let mut index = 0;

        while index < tasks.len() {
            if tasks[index].processed {
                index += 1;
                continue;
            }
            let folder = tasks[index].path.clone();
            let listing =
                self.lister
                    .list_folder(&folder)
                    .await
                    .map_err(|source| CrawlError::Listing {
                        path: folder.clone(),
                        source,
                    })?;
            tasks[index].processed = true;
            debug!(
                folder = %folder,
                files = listing.files.len(),
                folders = listing.folders.len(),
                "remote folder listed"
            );

            for file in listing.files {
                let path = normalize_remote_path(&file.server_relative_url);
                let relative_path =
                    relative_remote_path(&root, &path).ok_or_else(|| CrawlError::OutsideRoot {
                        path: path.clone(),
                        root: root.clone(),
                    })?;
                files.push(RemoteFileRecord {
                    path,
                    relative_path,
                    length: file.length,
                });
            }
            tasks.extend(listing.folders.into_iter().map(|sub| RemoteFolderTask {
                path: normalize_remote_path(&sub.server_relative_url),
                processed: sub.item_count == 0,
            }));
            index += 1;
        }

        Ok(files)
    }
}
