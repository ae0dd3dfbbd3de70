//! Watch-mode uploads.
//!
//! Change events pass two stages. A per-path debounce timer collapses bursts
//! into one trigger. The trigger then goes through a per-path request counter
//! (the save queue): at most one upload per path is in flight, and triggers
//! that arrive meanwhile only bump the counter. Each finished upload, failed
//! or not, decrements the counter; while it stays positive another upload
//! follows, reading the file's current content at start.
//!
//! `on_change` spawns tokio tasks and must be called inside a runtime.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sprest_core::SpError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::paths::{PathError, RemoteTarget, remote_target};
use super::remote::FileWriter;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Called with the local path after every successful upload.
pub type ChangeNotifier = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("remote write failed: {0}")]
    Remote(#[from] SpError),
}

struct DebounceTimer {
    id: u64,
    handle: JoinHandle<()>,
}

pub struct UploadCoordinator<W> {
    writer: Arc<W>,
    local_root: Arc<PathBuf>,
    remote_root: Arc<str>,
    debounce: Duration,
    notifier: Option<ChangeNotifier>,
    timers: Arc<Mutex<HashMap<PathBuf, DebounceTimer>>>,
    save_queue: Arc<Mutex<HashMap<PathBuf, usize>>>,
    next_timer_id: Arc<AtomicU64>,
}

impl<W> Clone for UploadCoordinator<W> {
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            local_root: Arc::clone(&self.local_root),
            remote_root: Arc::clone(&self.remote_root),
            debounce: self.debounce,
            notifier: self.notifier.clone(),
            timers: Arc::clone(&self.timers),
            save_queue: Arc::clone(&self.save_queue),
            next_timer_id: Arc::clone(&self.next_timer_id),
        }
    }
}

impl<W> UploadCoordinator<W>
where
    W: FileWriter + Send + Sync + 'static,
{
    pub fn new(writer: W, local_root: PathBuf, remote_root: &str) -> Self {
        Self {
            writer: Arc::new(writer),
            local_root: Arc::new(local_root),
            remote_root: Arc::from(remote_root),
            debounce: DEFAULT_DEBOUNCE,
            notifier: None,
            timers: Arc::default(),
            save_queue: Arc::default(),
            next_timer_id: Arc::default(),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Entry point for one raw change event of a file under the local root.
    pub fn on_change(&self, path: PathBuf) {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let coordinator = self.clone();
        let timer_path = path.clone();
        let debounce = self.debounce;

        // Holding the map lock while spawning keeps the timer from observing
        // the map before its own entry is in place.
        let mut timers = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            coordinator.debounce_elapsed(timer_path, id);
        });
        if let Some(previous) = timers.insert(path, DebounceTimer { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Outstanding upload requests for `path`, including the one in flight.
    pub fn pending(&self, path: &Path) -> usize {
        lock(&self.save_queue).get(path).copied().unwrap_or(0)
    }

    fn debounce_elapsed(&self, path: PathBuf, id: u64) {
        {
            let mut timers = lock(&self.timers);
            match timers.get(&path) {
                Some(timer) if timer.id == id => {
                    timers.remove(&path);
                }
                _ => return,
            }
        }
        self.enqueue(path);
    }

    fn enqueue(&self, path: PathBuf) {
        let start = {
            let mut queue = lock(&self.save_queue);
            let pending = queue.entry(path.clone()).or_insert(0);
            *pending += 1;
            *pending == 1
        };
        if start {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.drain(path).await });
        } else {
            debug!(path = %path.display(), "upload in flight, request queued");
        }
    }

    async fn drain(&self, path: PathBuf) {
        loop {
            match self.upload(&path).await {
                Ok(target) => {
                    info!(path = %path.display(), remote = %target.path(), "uploaded");
                    if let Some(notifier) = &self.notifier {
                        notifier(&path);
                    }
                }
                Err(UploadError::Remote(err)) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        class = ?err.classification(),
                        "upload failed"
                    );
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "upload failed");
                }
            }
            if !self.finish_one(&path) {
                break;
            }
        }
    }

    /// Decrements the counter after an upload; `true` when another upload
    /// must follow. The entry is removed once it reaches zero.
    fn finish_one(&self, path: &Path) -> bool {
        let mut queue = lock(&self.save_queue);
        let remaining = match queue.get_mut(path) {
            Some(pending) => {
                *pending = pending.saturating_sub(1);
                *pending
            }
            None => 0,
        };
        if remaining == 0 {
            queue.remove(path);
        }
        remaining > 0
    }

    async fn upload(&self, path: &Path) -> Result<RemoteTarget, UploadError> {
        let target = remote_target(&self.remote_root, &self.local_root, path)?;
        let content = tokio::fs::read(path)
            .await
            .map_err(|source| UploadError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        self.writer
            .write_file(&target.folder, &target.file_name, content)
            .await?;
        Ok(target)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprest_core::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::{TempDir, tempdir};
    use tokio::sync::mpsc;
    use tokio::time::{Instant, sleep};

    #[derive(Debug, Clone)]
    struct Upload {
        at: Instant,
        folder: String,
        file_name: String,
        content: Vec<u8>,
    }

    struct FakeWriter {
        latency: Duration,
        uploads: Mutex<Vec<Upload>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_next: AtomicBool,
        started: mpsc::UnboundedSender<()>,
    }

    impl FakeWriter {
        fn new(latency: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
            let (started, rx) = mpsc::unbounded_channel();
            let writer = Arc::new(Self {
                latency,
                uploads: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
                started,
            });
            (writer, rx)
        }

        fn uploads(&self) -> Vec<Upload> {
            self.uploads.lock().unwrap().clone()
        }
    }

    impl FileWriter for FakeWriter {
        async fn write_file(
            &self,
            folder: &str,
            file_name: &str,
            content: Vec<u8>,
        ) -> Result<(), SpError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            self.uploads.lock().unwrap().push(Upload {
                at: Instant::now(),
                folder: folder.to_string(),
                file_name: file_name.to_string(),
                content,
            });
            let _ = self.started.send(());
            sleep(self.latency).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(SpError::Api {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    body: "try later".into(),
                });
            }
            Ok(())
        }
    }

    fn setup(
        latency: Duration,
    ) -> (
        TempDir,
        Arc<FakeWriter>,
        mpsc::UnboundedReceiver<()>,
        UploadCoordinator<Arc<FakeWriter>>,
    ) {
        let dir = tempdir().unwrap();
        let (writer, started) = FakeWriter::new(latency);
        let coordinator = UploadCoordinator::new(
            Arc::clone(&writer),
            dir.path().to_path_buf(),
            "/sites/dev/app",
        );
        (dir, writer, started, coordinator)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_uploads_once_after_quiet_period() {
        let (dir, writer, mut started, coordinator) = setup(Duration::from_millis(200));
        let path = dir.path().join("x.css");
        let begin = Instant::now();

        std::fs::write(&path, b"a").unwrap();
        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(10)).await;
        std::fs::write(&path, b"ab").unwrap();
        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(10)).await;
        std::fs::write(&path, b"abc").unwrap();
        coordinator.on_change(path.clone());

        started.recv().await.unwrap();
        sleep(Duration::from_secs(1)).await;

        let uploads = writer.uploads();
        assert_eq!(uploads.len(), 1);
        let offset = uploads[0].at - begin;
        assert!(offset >= Duration::from_millis(70), "started at {offset:?}");
        assert!(offset < Duration::from_millis(80), "started at {offset:?}");
        assert_eq!(uploads[0].content, b"abc");
        assert_eq!(uploads[0].folder, "/sites/dev/app");
        assert_eq!(uploads[0].file_name, "x.css");
        assert_eq!(coordinator.pending(&path), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn many_events_in_window_trigger_one_upload() {
        let (dir, writer, _started, coordinator) = setup(Duration::from_millis(5));
        let path = dir.path().join("bundle.js");
        std::fs::write(&path, b"bundle").unwrap();

        for _ in 0..8 {
            coordinator.on_change(path.clone());
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_secs(1)).await;

        assert_eq!(writer.uploads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn changes_during_upload_are_serialized_one_upload_per_request() {
        let (dir, writer, mut started, coordinator) = setup(Duration::from_millis(200));
        let path = dir.path().join("css/site.css");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"v1").unwrap();

        coordinator.on_change(path.clone());
        started.recv().await.unwrap();

        std::fs::write(&path, b"v2").unwrap();
        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(60)).await;
        std::fs::write(&path, b"v3").unwrap();
        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(60)).await;
        assert_eq!(coordinator.pending(&path), 3);

        started.recv().await.unwrap();
        assert_eq!(coordinator.pending(&path), 2);
        std::fs::write(&path, b"v4-final").unwrap();

        sleep(Duration::from_secs(2)).await;

        let uploads = writer.uploads();
        assert_eq!(writer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0].content, b"v1");
        assert_eq!(uploads[1].content, b"v3");
        assert_eq!(uploads[2].content, b"v4-final");
        assert_eq!(uploads[2].folder, "/sites/dev/app/css");
        assert!(uploads[1].at - uploads[0].at >= Duration::from_millis(200));
        assert!(uploads[2].at - uploads[1].at >= Duration::from_millis(200));
        assert_eq!(coordinator.pending(&path), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_with_queued_request_is_resubmitted() {
        let (dir, writer, mut started, coordinator) = setup(Duration::from_millis(100));
        let path = dir.path().join("app.js");
        std::fs::write(&path, b"broken").unwrap();
        writer.fail_next.store(true, Ordering::SeqCst);

        coordinator.on_change(path.clone());
        started.recv().await.unwrap();
        std::fs::write(&path, b"fixed").unwrap();
        coordinator.on_change(path.clone());
        sleep(Duration::from_secs(1)).await;

        let uploads = writer.uploads();
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[1].content, b"fixed");
        assert_eq!(coordinator.pending(&path), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_paths_upload_independently() {
        let (dir, writer, _started, coordinator) = setup(Duration::from_millis(200));
        let a = dir.path().join("a.js");
        let b = dir.path().join("b.js");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        coordinator.on_change(a.clone());
        coordinator.on_change(b.clone());
        sleep(Duration::from_secs(1)).await;

        assert_eq!(writer.uploads().len(), 2);
        assert_eq!(writer.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_is_retried_by_next_change() {
        let (dir, writer, mut started, coordinator) = setup(Duration::from_millis(100));
        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        let coordinator = coordinator.with_notifier(Arc::new(move |path: &Path| {
            sink.lock().unwrap().push(path.to_path_buf());
        }));
        let path = dir.path().join("index.html");
        std::fs::write(&path, b"<html>").unwrap();
        writer.fail_next.store(true, Ordering::SeqCst);

        coordinator.on_change(path.clone());
        started.recv().await.unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(coordinator.pending(&path), 0);
        assert!(notified.lock().unwrap().is_empty());

        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(500)).await;

        assert_eq!(writer.uploads().len(), 2);
        assert_eq!(*notified.lock().unwrap(), vec![path.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_file_clears_the_queue() {
        let (dir, writer, _started, coordinator) = setup(Duration::from_millis(10));
        let path = dir.path().join("tmp.swp");

        coordinator.on_change(path.clone());
        sleep(Duration::from_millis(500)).await;

        assert!(writer.uploads().is_empty());
        assert_eq!(coordinator.pending(&path), 0);
    }
}
