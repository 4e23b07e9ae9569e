//! Watch folders for media that only needs transcoding
//!
//! Each configured directory is scanned when the watcher starts and then
//! monitored (non-recursively) for new or modified media files. A file is
//! taken in once its size has stayed the same for the folder's
//! `settle_interval`, so files still being copied are left alone. Intake
//! creates a transcode task with origin `watch-folder`; a file that is already
//! the source or target of a task is ignored.

use crate::config::WatchFolderConfig;
use crate::error::{Error, Result};
use crate::transcode::{TranscodeQueue, TranscodeRequest};
use crate::types::TranscodeOrigin;
use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often pending files are checked for a stable size
const SETTLE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "ts", "m2ts", "mts", "wmv", "flv", "webm", "mpg", "mpeg",
];

#[derive(Debug, Clone, Copy)]
struct PendingFile {
    size: u64,
    stable_since: Instant,
}

/// Watches folders for media files and queues them for transcoding
pub struct FolderWatcher {
    /// Filesystem watcher instance
    watcher: RecommendedWatcher,

    /// Channel for receiving filesystem events
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,

    queue: TranscodeQueue,

    /// Watched folder configurations
    configs: Vec<WatchFolderConfig>,

    /// Files seen but not yet settled
    pending: HashMap<PathBuf, PendingFile>,
}

impl FolderWatcher {
    /// Create a watcher feeding `queue`
    ///
    /// # Errors
    /// Returns error if the filesystem watcher cannot be initialized
    pub fn new(queue: TranscodeQueue, configs: Vec<WatchFolderConfig>) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    error!("Failed to send filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::FolderWatch(e.to_string()))?;

        Ok(Self {
            watcher,
            rx,
            queue,
            configs,
            pending: HashMap::new(),
        })
    }

    /// Register every configured folder, creating missing ones
    ///
    /// # Errors
    /// Returns error if any folder cannot be created or watched
    pub fn start(&mut self) -> Result<()> {
        for config in &self.configs {
            if !config.path.exists() {
                std::fs::create_dir_all(&config.path).map_err(|e| {
                    Error::FolderWatch(format!("Failed to create watch folder: {}", e))
                })?;
                info!("Created watch folder: {}", config.path.display());
            }

            self.watcher
                .watch(&config.path, RecursiveMode::NonRecursive)
                .map_err(|e| Error::FolderWatch(format!("Failed to watch folder: {}", e)))?;

            info!(
                folder = %config.path.display(),
                priority = config.priority.get(),
                "Watching folder"
            );
        }
        Ok(())
    }

    /// Scan existing files, then process events until `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Folder watcher started");
        self.scan_existing().await;

        let mut settle = tokio::time::interval(SETTLE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.rx.recv() => match result {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => error!("Filesystem watcher error: {}", e),
                    None => break,
                },
                _ = settle.tick() => self.check_settled().await,
            }
        }
        info!("Folder watcher stopped");
    }

    /// Queue every media file already present in the watched folders
    async fn scan_existing(&mut self) {
        let folders: Vec<PathBuf> = self.configs.iter().map(|c| c.path.clone()).collect();
        for folder in folders {
            let mut entries = match tokio::fs::read_dir(&folder).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(folder = %folder.display(), error = %e, "Failed to scan watch folder");
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if is_media_file(&path) {
                    self.observe(&path).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: notify::Event) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            if is_media_file(&path) {
                self.observe(&path).await;
            }
        }
    }

    /// Start or restart the settle clock for `path`
    async fn observe(&mut self, path: &Path) {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            self.pending.remove(path);
            return;
        };
        if !metadata.is_file() {
            return;
        }
        let size = metadata.len();
        match self.pending.get_mut(path) {
            Some(pending) if pending.size == size => {}
            Some(pending) => {
                pending.size = size;
                pending.stable_since = Instant::now();
            }
            None => {
                debug!(path = %path.display(), size, "Watch folder file seen");
                self.pending.insert(
                    path.to_path_buf(),
                    PendingFile {
                        size,
                        stable_since: Instant::now(),
                    },
                );
            }
        }
    }

    /// Take in files whose size has not changed for their folder's settle interval
    async fn check_settled(&mut self) {
        let paths: Vec<PathBuf> = self.pending.keys().cloned().collect();
        for path in paths {
            let size = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    self.pending.remove(&path);
                    continue;
                }
            };
            let Some(pending) = self.pending.get(&path).copied() else {
                continue;
            };
            if pending.size != size {
                self.pending.insert(
                    path,
                    PendingFile {
                        size,
                        stable_since: Instant::now(),
                    },
                );
                continue;
            }

            let Ok(config) = self.find_config_for_path(&path) else {
                self.pending.remove(&path);
                continue;
            };
            if pending.stable_since.elapsed() < config.settle_interval {
                continue;
            }

            let priority = config.priority;
            self.pending.remove(&path);
            if let Err(e) = self.intake(&path, priority).await {
                error!(path = %path.display(), error = %e, "Failed to queue watch folder file");
            }
        }
    }

    async fn intake(&self, path: &Path, priority: crate::types::Priority) -> Result<()> {
        if self.queue.has_task_for(path).await? {
            debug!(path = %path.display(), "Watch folder file already has a task");
            return Ok(());
        }
        let task = self
            .queue
            .submit(TranscodeRequest {
                job_id: None,
                source: path.to_path_buf(),
                priority,
                origin: TranscodeOrigin::WatchFolder,
            })
            .await?;
        info!(task_id = task.0, path = %path.display(), "Queued watch folder file");
        Ok(())
    }

    /// Find the watch folder config that matches this path
    fn find_config_for_path(&self, path: &Path) -> Result<&WatchFolderConfig> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::FolderWatch("File has no parent directory".to_string()))?;

        self.configs
            .iter()
            .find(|c| c.path == parent)
            .ok_or_else(|| {
                Error::FolderWatch(format!(
                    "No watch folder config found for: {}",
                    parent.display()
                ))
            })
    }
}

/// Visible file with a known media extension
pub(crate) fn is_media_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('.'));
    !hidden
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MEDIA_EXTENSIONS.iter().any(|m| ext.eq_ignore_ascii_case(m)))
}
