//! Composition of the sync engine: one-shot push and pull, watch session and
//! custom-action URL resolution.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sprest_core::SpClient;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{CustomActionDefinition, SyncConfig};
use crate::sync::coordinator::{ChangeNotifier, UploadCoordinator, UploadError};
use crate::sync::crawler::{CrawlError, RemoteFileRecord, RemoteTreeCrawler};
use crate::sync::delete::DeletePropagator;
use crate::sync::diff::{self, UploadDecision};
use crate::sync::local_walker::walk;
use crate::sync::paths::{local_relative_path, local_target, remote_target};
use crate::sync::remote::{
    FileDeleter, FileReader, FileWriter, FolderLister, SpRemote, TokenSource,
};
use crate::sync::tokens::TokenResolver;
use crate::sync::watcher::{FsEvent, start_watcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub relative_path: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<TransferFailure>,
    pub deleted: usize,
}

impl PushReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PullReport {
    pub downloaded: Vec<String>,
    pub failed: Vec<TransferFailure>,
}

impl PullReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Publisher<R> {
    remote: Arc<R>,
    local_root: PathBuf,
    remote_root: String,
    delete_files: bool,
    debounce: Duration,
}

impl Publisher<SpRemote> {
    pub async fn connect(config: &SyncConfig) -> anyhow::Result<Self> {
        let local_root = std::fs::canonicalize(&config.dist_folder).with_context(|| {
            format!("dist folder {} is not accessible", config.dist_folder.display())
        })?;
        let publish_root = config.publish_root();
        let client = SpClient::new(config.site_url.as_str(), &config.token)
            .context("failed to build REST client")?;
        let remote = SpRemote::connect(client, &publish_root)
            .await
            .with_context(|| format!("failed to connect to {}", config.site_url))?;
        info!(site = %config.site_url, web = %remote.web_root(), root = %publish_root, "connected");

        Ok(Self::new(
            remote,
            local_root,
            &publish_root,
            config.delete_files,
            config.debounce,
        ))
    }
}

impl<R> Publisher<R>
where
    R: FolderLister + FileReader + FileWriter + FileDeleter + TokenSource + Send + Sync + 'static,
{
    pub fn new(
        remote: R,
        local_root: PathBuf,
        remote_root: &str,
        delete_files: bool,
        debounce: Duration,
    ) -> Self {
        Self {
            remote: Arc::new(remote),
            local_root,
            remote_root: remote_root.to_string(),
            delete_files,
            debounce,
        }
    }

    /// Uploads the local tree. With `diff`, files whose size matches the
    /// remote copy are skipped and, when delete propagation is enabled,
    /// remote files without a local counterpart are removed.
    pub async fn push(&self, diff: bool) -> anyhow::Result<PushReport> {
        let root = self.local_root.clone();
        let local_paths = tokio::task::spawn_blocking(move || walk(&root))
            .await
            .context("local walk task failed")?
            .with_context(|| format!("failed to walk {}", self.local_root.display()))?;
        info!(files = local_paths.len(), diff, "push started");

        let remote_records = if diff {
            self.crawl_remote().await?
        } else {
            Vec::new()
        };
        let decisions = if diff {
            let (paths, records, root) = (
                local_paths.clone(),
                remote_records.clone(),
                self.local_root.clone(),
            );
            tokio::task::spawn_blocking(move || diff::plan(&paths, &records, &root))
                .await
                .context("planning task failed")??
        } else {
            local_paths
                .iter()
                .map(|path| {
                    Ok(UploadDecision {
                        local_path: path.clone(),
                        relative_path: local_relative_path(&self.local_root, path)?,
                        upload: true,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?
        };

        let mut report = PushReport::default();
        for decision in decisions {
            if !decision.upload {
                debug!(path = %decision.relative_path, "unchanged, skipped");
                report.skipped.push(decision.relative_path);
                continue;
            }
            match self.upload(&decision.local_path).await {
                Ok(()) => {
                    info!(path = %decision.relative_path, "uploaded");
                    report.uploaded.push(decision.relative_path);
                }
                Err(err) => {
                    warn!(path = %decision.relative_path, error = %err, "upload failed");
                    report.failed.push(TransferFailure {
                        relative_path: decision.relative_path,
                        error: err.to_string(),
                    });
                }
            }
        }

        if diff && self.delete_files {
            let orphans: Vec<String> =
                diff::orphans(&local_paths, &remote_records, &self.local_root)?
                    .into_iter()
                    .map(|record| record.path.clone())
                    .collect();
            if !orphans.is_empty() {
                report.deleted = self.propagator().delete_queue(&orphans).await;
            }
        }

        info!(
            uploaded = report.uploaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            deleted = report.deleted,
            "push finished"
        );
        Ok(report)
    }

    /// Downloads every remote file below the publish root into the local
    /// tree, overwriting local copies. Local files without a remote
    /// counterpart are left alone.
    pub async fn pull(&self) -> anyhow::Result<PullReport> {
        let records = self.crawl_remote().await?;
        info!(files = records.len(), "pull started");

        let mut report = PullReport::default();
        for record in records {
            match self.download(&record).await {
                Ok(()) => {
                    info!(path = %record.relative_path, "downloaded");
                    report.downloaded.push(record.relative_path);
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!(path = %record.relative_path, error = %error, "download failed");
                    report.failed.push(TransferFailure {
                        relative_path: record.relative_path,
                        error,
                    });
                }
            }
        }

        info!(
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Watches the local tree until Ctrl-C.
    pub async fn watch(&self, notifier: ChangeNotifier) -> anyhow::Result<()> {
        let (_watcher, events) = start_watcher(&self.local_root)
            .with_context(|| format!("failed to watch {}", self.local_root.display()))?;
        info!(root = %self.local_root.display(), "watching for changes");
        self.run_events(events, notifier, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for Ctrl-C");
            }
        })
        .await;
        info!("watch stopped");
        Ok(())
    }

    /// Feeds file events into the upload and delete paths until `shutdown`
    /// completes or the event stream ends.
    pub async fn run_events(
        &self,
        mut events: mpsc::UnboundedReceiver<FsEvent>,
        notifier: ChangeNotifier,
        shutdown: impl Future<Output = ()>,
    ) {
        let coordinator = UploadCoordinator::new(
            Arc::clone(&self.remote),
            self.local_root.clone(),
            &self.remote_root,
        )
        .with_debounce(self.debounce)
        .with_notifier(notifier);
        let propagator = Arc::new(self.propagator());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(FsEvent::Change(path)) => coordinator.on_change(path),
                    Some(FsEvent::Unlink(path)) if self.delete_files => {
                        let propagator = Arc::clone(&propagator);
                        tokio::spawn(async move {
                            if let Err(err) = propagator.on_delete(&path).await {
                                warn!(path = %path.display(), error = %err, "delete failed");
                            }
                        });
                    }
                    Some(FsEvent::Unlink(path)) => {
                        debug!(path = %path.display(), "delete propagation disabled");
                    }
                    None => break,
                },
            }
        }
    }

    pub async fn resolve_custom_actions(
        &self,
        actions: &[CustomActionDefinition],
    ) -> Vec<CustomActionDefinition> {
        let resolver = TokenResolver::new(Arc::clone(&self.remote));
        resolve_custom_actions(actions, &resolver).await
    }

    /// A publish root that does not exist yet is an empty remote tree.
    async fn crawl_remote(&self) -> anyhow::Result<Vec<RemoteFileRecord>> {
        match RemoteTreeCrawler::new(&*self.remote)
            .crawl(&self.remote_root)
            .await
        {
            Ok(records) => Ok(records),
            Err(CrawlError::Listing { path, source })
                if source.is_not_found() && path == self.remote_root =>
            {
                info!(root = %path, "remote root missing, treating as empty");
                Ok(Vec::new())
            }
            Err(err) => Err(err).context("failed to crawl remote tree"),
        }
    }

    /// Content lands in a `.partial` sibling first and is renamed into place.
    async fn download(&self, record: &RemoteFileRecord) -> anyhow::Result<()> {
        let target = local_target(&self.local_root, &record.relative_path)?;
        let content = self.remote.read_file(&record.path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut partial = target.clone().into_os_string();
        partial.push(".partial");
        tokio::fs::write(&partial, content)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
        tokio::fs::rename(&partial, &target)
            .await
            .with_context(|| format!("failed to replace {}", target.display()))?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path) -> Result<(), UploadError> {
        let target = remote_target(&self.remote_root, &self.local_root, local_path)?;
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|source| UploadError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        self.remote
            .write_file(&target.folder, &target.file_name, content)
            .await?;
        Ok(())
    }

    fn propagator(&self) -> DeletePropagator<Arc<R>> {
        DeletePropagator::new(
            Arc::clone(&self.remote),
            self.local_root.clone(),
            &self.remote_root,
        )
    }
}

/// Resolves tokens in each action's script URL. Actions whose tokens point at
/// something that does not exist are dropped.
pub async fn resolve_custom_actions<S: TokenSource>(
    actions: &[CustomActionDefinition],
    resolver: &TokenResolver<S>,
) -> Vec<CustomActionDefinition> {
    let mut resolved = Vec::with_capacity(actions.len());
    for action in actions {
        if !resolver.is_tokenized(&action.script_src) {
            resolved.push(action.clone());
            continue;
        }
        match resolver.resolve(&action.script_src).await {
            Some(script_src) => resolved.push(CustomActionDefinition {
                script_src,
                ..action.clone()
            }),
            None => warn!(
                action = action.name.as_deref().unwrap_or(&action.script_src),
                "custom action skipped, token could not be resolved"
            ),
        }
    }
    resolved
}
