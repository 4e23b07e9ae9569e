//! Download queue manager split into focused submodules.
//!
//! The [`DownloadManager`] owns the job registry and is organized by concern:
//! - [`control`] - enqueue, cancel, reprioritize and query jobs
//! - [`dispatch`] - admission loop and per-job outcome handling
//! - [`usenet`] - segment retrieval, reassembly, repair and extraction for NZB jobs
//! - [`background_tasks`] - progress reporting and batched segment state writes
//! - [`lifecycle`] - startup restore, transcode handoff and shutdown
//! - [`events`] - per-job event streams

mod background_tasks;
mod control;
mod dispatch;
mod events;
mod lifecycle;
mod usenet;


use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::fetcher::SegmentFetcher;
use crate::http::HttpDownloader;
use crate::provider::{NntpConnector, ProviderPool, SessionConnector};
use crate::queue::AdmissionQueue;
use crate::repair::{CliParityHandler, NoOpParityHandler, ParityHandler, RepairStage};
use crate::transcode::{FfmpegEncoder, MediaEncoder, TranscodeFinished, TranscodeQueue};
use crate::types::{Event, JobId};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, Semaphore, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A job holding a download slot
struct ActiveJob {
    cancel: CancellationToken,
    /// Resolves when the job task exits
    exited: watch::Receiver<()>,
}

struct Inner {
    db: Arc<Database>,
    config: Arc<Config>,
    event_tx: broadcast::Sender<Event>,
    fetcher: SegmentFetcher,
    repair: RepairStage,
    http: HttpDownloader,
    transcode: Option<TranscodeQueue>,
    finished_rx: Mutex<Option<mpsc::UnboundedReceiver<TranscodeFinished>>>,
    slots: Arc<Semaphore>,
    // Lock order: waiting, then active
    waiting: Mutex<AdmissionQueue<JobId>>,
    active: Mutex<HashMap<JobId, ActiveJob>>,
    active_count: watch::Sender<usize>,
    wake: Notify,
    /// Serializes duplicate detection with job insertion
    intake: tokio::sync::Mutex<()>,
    /// Serializes terminal transitions made outside a job task
    finalize: tokio::sync::Mutex<()>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Download queue manager (cloneable; all state is shared)
///
/// Jobs wait in a priority queue ordered by `(priority DESC, queue_seq ASC)` and
/// are admitted while fewer than `max_concurrent_jobs` hold a download slot. Each
/// admitted job runs as its own task through download, repair and extraction,
/// then hands its media to the transcode queue.
///
/// ```no_run
/// use media_acquire::{Config, DownloadManager, JobRequest, Priority};
///
/// # async fn example() -> media_acquire::Result<()> {
/// let manager = DownloadManager::new(Config::default()).await?;
/// manager.start().await?;
///
/// let id = manager
///     .enqueue(JobRequest::http("https://example.com/movie.mkv").with_priority(Priority::new(80)))
///     .await?;
/// let mut events = manager.subscribe();
/// while let Ok(event) = events.recv().await {
///     if event.job_id() == Some(id) && event.is_job_terminal() {
///         break;
///     }
/// }
/// manager.shutdown().await
/// # }
/// ```
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

/// Builder for a [`DownloadManager`] with replaceable collaborators
pub struct ManagerBuilder {
    config: Config,
    connector: Option<Arc<dyn SessionConnector>>,
    parity: Option<Arc<dyn ParityHandler>>,
    encoder: Option<Option<Arc<dyn MediaEncoder>>>,
}

impl ManagerBuilder {
    /// Open provider sessions through `connector` instead of NNTP
    pub fn connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Verify and repair with `handler` instead of the par2 binary
    pub fn parity_handler(mut self, handler: Arc<dyn ParityHandler>) -> Self {
        self.parity = Some(handler);
        self
    }

    /// Transcode with `encoder` instead of ffmpeg
    pub fn encoder(mut self, encoder: Arc<dyn MediaEncoder>) -> Self {
        self.encoder = Some(Some(encoder));
        self
    }

    /// Run without a transcode queue; jobs complete after extraction
    pub fn without_encoder(mut self) -> Self {
        self.encoder = Some(None);
        self
    }

    /// Open the database and assemble the manager
    ///
    /// Nothing is admitted until [`DownloadManager::start`] is called.
    pub async fn build(self) -> Result<DownloadManager> {
        let Self {
            config,
            connector,
            parity,
            encoder,
        } = self;
        config.validate()?;

        for dir in [&config.download.download_dir, &config.download.temp_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        let providers = merge_persisted_providers(&db, &config).await?;

        let connector = connector.unwrap_or_else(|| Arc::new(NntpConnector));
        let pool = Arc::new(ProviderPool::new(providers, connector));
        let fetcher = SegmentFetcher::new(
            pool,
            config.download.acquire_timeout,
            config.download.fetch_timeout,
        );

        let parity: Arc<dyn ParityHandler> = match parity {
            Some(handler) => handler,
            None => match CliParityHandler::from_config(&config.tools) {
                Some(handler) => Arc::new(handler),
                None => Arc::new(NoOpParityHandler),
            },
        };
        tracing::info!(parity_handler = parity.name(), "Parity handler initialized");

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let encoder = match encoder {
            Some(choice) => choice,
            None if config.transcode.enabled => {
                FfmpegEncoder::from_config(&config.transcode, config.tools.search_path)
                    .map(|e| Arc::new(e) as Arc<dyn MediaEncoder>)
            }
            None => None,
        };
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let transcode = match encoder {
            Some(encoder) if config.transcode.enabled => {
                tracing::info!(encoder = encoder.name(), "Transcode queue enabled");
                Some(TranscodeQueue::new(
                    Arc::clone(&db),
                    encoder,
                    config.transcode.clone(),
                    event_tx.clone(),
                    Some(finished_tx),
                ))
            }
            _ => {
                if config.transcode.enabled {
                    tracing::warn!("No encoder available; jobs complete without transcoding");
                }
                None
            }
        };

        let http = HttpDownloader::new(&config.http)?;
        let slots = Arc::new(Semaphore::new(config.download.max_concurrent_jobs));
        let (active_count, _) = watch::channel(0);

        Ok(DownloadManager {
            inner: Arc::new(Inner {
                db,
                config: Arc::new(config),
                event_tx,
                fetcher,
                repair: RepairStage::new(parity),
                http,
                transcode,
                finished_rx: Mutex::new(Some(finished_rx)),
                slots,
                waiting: Mutex::new(AdmissionQueue::default()),
                active: Mutex::new(HashMap::new()),
                active_count,
                wake: Notify::new(),
                intake: tokio::sync::Mutex::new(()),
                finalize: tokio::sync::Mutex::new(()),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// Configured providers, with administrative changes persisted by an earlier
/// run taking precedence; the result is written back as the new mirror
async fn merge_persisted_providers(
    db: &Database,
    config: &Config,
) -> Result<Vec<crate::config::ProviderConfig>> {
    let persisted = db.list_providers().await?;
    let mut providers = Vec::with_capacity(config.providers.len());
    for configured in &config.providers {
        let provider = persisted
            .iter()
            .find(|p| p.name == configured.name)
            .cloned()
            .unwrap_or_else(|| configured.clone());
        db.upsert_provider(&provider).await?;
        providers.push(provider);
    }
    Ok(providers)
}

impl DownloadManager {
    /// Create a manager with NNTP sessions, the par2 binary and ffmpeg when found
    pub async fn new(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Start building a manager with replaceable collaborators
    pub fn builder(config: Config) -> ManagerBuilder {
        ManagerBuilder {
            config,
            connector: None,
            parity: None,
            encoder: None,
        }
    }

    /// Subscribe to every job and transcode event
    ///
    /// Subscribers that fall more than 1000 events behind receive
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// The configuration the manager was built with
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.inner.config)
    }

    /// The transcode queue, when an encoder is available
    pub fn transcode_queue(&self) -> Option<&TranscodeQueue> {
        self.inner.transcode.as_ref()
    }

    /// The provider pool segment fetches draw sessions from
    pub fn provider_pool(&self) -> &Arc<ProviderPool> {
        self.inner.fetcher.pool()
    }

    /// Database handle, for collaborators that display persisted state
    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        self.inner.event_tx.send(event).ok();
    }

    fn waiting(&self) -> MutexGuard<'_, AdmissionQueue<JobId>> {
        self.inner
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
