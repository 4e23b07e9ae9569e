//! Transcode queue
//!
//! Finished downloads and watch-folder finds become tasks that wait for an
//! encoder slot in `(priority DESC, queue_seq ASC)` order, the same admission
//! rule the download queue uses. Every task is probed first; a source that
//! already satisfies the target profile is marked skipped instead of encoded.
//!
//! Output is written to a hidden staging file next to the target and renamed
//! into place only when the encoder succeeds.

mod encoder;
mod ffmpeg;

pub use encoder::{EncodeProgress, MediaEncoder, MediaProbe};
pub use ffmpeg::FfmpegEncoder;

use crate::config::{TargetProfile, TranscodeConfig};
use crate::db::{Database, NewTranscodeTask, TranscodeRow};
use crate::error::{Error, JobError, Result};
use crate::queue::AdmissionQueue;
use crate::types::{
    Event, JobId, Priority, TaskId, TranscodeInfo, TranscodeOrigin, TranscodeStatus,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// How often terminal tasks past their retention are purged
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Request to transcode one file
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Download job the file came from
    pub job_id: Option<JobId>,
    /// Input media
    pub source: PathBuf,
    /// Admission priority
    pub priority: Priority,
    /// Where the request came from
    pub origin: TranscodeOrigin,
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    /// Encoded output is at this path
    Completed(PathBuf),
    /// The source at this path already satisfied the profile
    Skipped(PathBuf),
    /// Failed after the retry budget
    Failed(String),
    /// Cancelled by the user or with its job
    Cancelled,
}

/// Notification that a task reached a terminal state
#[derive(Debug, Clone)]
pub struct TranscodeFinished {
    /// The task
    pub task: TaskId,
    /// Owning job, if any
    pub job: Option<JobId>,
    /// How it ended
    pub outcome: TranscodeOutcome,
}

enum Transcoded {
    Encoded,
    Skipped(String),
}

/// Priority queue of transcode tasks with a bounded number of concurrent encodes
#[derive(Clone)]
pub struct TranscodeQueue {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Database>,
    encoder: Arc<dyn MediaEncoder>,
    config: TranscodeConfig,
    event_tx: broadcast::Sender<Event>,
    finished_tx: Option<mpsc::UnboundedSender<TranscodeFinished>>,
    slots: Arc<Semaphore>,
    // Lock order: waiting, then running
    waiting: Mutex<AdmissionQueue<TaskId>>,
    running: Mutex<HashMap<TaskId, CancellationToken>>,
    running_count: watch::Sender<usize>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl TranscodeQueue {
    /// Create a queue; call [`start`](Self::start) to begin encoding
    ///
    /// Terminal outcomes are sent to `finished_tx` when one is given.
    pub fn new(
        db: Arc<Database>,
        encoder: Arc<dyn MediaEncoder>,
        config: TranscodeConfig,
        event_tx: broadcast::Sender<Event>,
        finished_tx: Option<mpsc::UnboundedSender<TranscodeFinished>>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let (running_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                db,
                encoder,
                config,
                event_tx,
                finished_tx,
                slots,
                waiting: Mutex::new(AdmissionQueue::default()),
                running: Mutex::new(HashMap::new()),
                running_count,
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Restore unfinished tasks and spawn the dispatcher
    ///
    /// Tasks that were encoding when the process stopped go back to the queue
    /// at their original position.
    pub async fn start(&self) -> Result<tokio::task::JoinHandle<()>> {
        let unfinished = self.inner.db.list_unfinished_transcode_tasks().await?;
        let restored = unfinished.len();
        for row in unfinished {
            let id = TaskId(row.id);
            if row.status() == TranscodeStatus::Running {
                self.inner
                    .db
                    .requeue_transcode_task(
                        id,
                        row.retry_count.max(0) as u32,
                        row.error_message.as_deref(),
                        row.queue_seq,
                    )
                    .await?;
            }
            self.waiting()
                .push(id, Priority::new(i64::from(row.priority)), row.queue_seq);
        }
        if restored > 0 {
            tracing::info!(restored, "Restored unfinished transcode tasks");
        }

        self.purge_logged().await;

        let queue = self.clone();
        Ok(tokio::spawn(async move { queue.dispatch().await }))
    }

    /// Add a task to the queue
    pub async fn submit(&self, request: TranscodeRequest) -> Result<TaskId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let target_path = target_path(&request.source, &self.inner.config.target);
        let queue_seq = self.inner.db.next_queue_seq();
        let id = self
            .inner
            .db
            .insert_transcode_task(&NewTranscodeTask {
                job_id: request.job_id,
                source_path: request.source.clone(),
                target_path,
                priority: request.priority,
                queue_seq,
                origin: request.origin,
            })
            .await?;

        self.waiting().push(id, request.priority, queue_seq);
        self.emit(Event::TranscodeQueued {
            task: id,
            job: request.job_id,
            origin: request.origin,
        });
        tracing::info!(
            task_id = id.0,
            job_id = request.job_id.map(|j| j.0),
            source = %request.source.display(),
            origin = request.origin.as_str(),
            "Transcode task queued"
        );
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Cancel a queued or running task
    ///
    /// Cancelling a task that already finished is a no-op.
    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        let row = self.row(id).await?;
        if row.status().is_terminal() {
            return Ok(());
        }

        let (was_waiting, token) = {
            let mut waiting = self.waiting();
            let removed = waiting.remove(id);
            let token = self.running().get(&id).cloned();
            (removed, token)
        };

        if let Some(token) = token {
            tracing::info!(task_id = id.0, "Cancelling running transcode");
            token.cancel();
            return Ok(());
        }

        if was_waiting || row.status() == TranscodeStatus::Queued {
            self.inner
                .db
                .finish_transcode_task(id, TranscodeStatus::Cancelled, None)
                .await?;
            self.emit(Event::TranscodeCancelled { task: id });
            self.notify_finished(id, row.job_id.map(JobId), TranscodeOutcome::Cancelled);
            tracing::info!(task_id = id.0, "Cancelled queued transcode");
        }
        Ok(())
    }

    /// Cancel the latest task created for a job, if it is still unfinished
    pub async fn cancel_for_job(&self, job: JobId) -> Result<()> {
        match self.inner.db.transcode_task_for_job(job).await? {
            Some(row) => self.cancel(TaskId(row.id)).await,
            None => Ok(()),
        }
    }

    /// Change a task's priority; a waiting task moves within the queue
    pub async fn set_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        let row = self.row(id).await?;
        if row.status().is_terminal() {
            return Ok(());
        }
        self.inner.db.set_transcode_priority(id, priority).await?;
        self.waiting().reprioritize(id, priority);
        Ok(())
    }

    /// Snapshot of one task
    pub async fn get(&self, id: TaskId) -> Result<TranscodeInfo> {
        Ok(self.row(id).await?.to_info())
    }

    /// Snapshot of every retained task in admission order
    pub async fn list(&self) -> Result<Vec<TranscodeInfo>> {
        let rows = self.inner.db.list_transcode_tasks().await?;
        Ok(rows.iter().map(TranscodeRow::to_info).collect())
    }

    /// Whether a live or finished task reads or writes `path`
    pub async fn has_task_for(&self, path: &Path) -> Result<bool> {
        self.inner.db.has_transcode_task_for(path).await
    }

    /// Delete terminal tasks older than the retention window
    pub async fn purge_expired(&self) -> Result<u64> {
        let retention = i64::try_from(self.inner.config.task_retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(retention);
        self.inner.db.purge_transcode_tasks_before(cutoff).await
    }

    /// Stop admitting tasks and interrupt running encodes
    ///
    /// Interrupted tasks return to `queued` and resume on the next start.
    pub async fn shutdown(&self, wait: Duration) {
        self.inner.shutdown.cancel();
        for token in self.running().values() {
            token.cancel();
        }

        let mut count = self.inner.running_count.subscribe();
        if tokio::time::timeout(wait, count.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            tracing::warn!("Transcode tasks still running after shutdown timeout");
        }
    }

    async fn dispatch(self) {
        let mut purge = tokio::time::interval(PURGE_INTERVAL);
        purge.tick().await;

        loop {
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = self.inner.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let admitted = loop {
                if let Some(admitted) = self.admit_next() {
                    break Some(admitted);
                }
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => break None,
                    _ = self.inner.wake.notified() => {}
                    _ = purge.tick() => self.purge_logged().await,
                }
            };
            let Some((id, cancel)) = admitted else {
                break;
            };

            let queue = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                queue.run_task(id, cancel).await;
            });
        }
        tracing::debug!("Transcode dispatcher stopped");
    }

    fn admit_next(&self) -> Option<(TaskId, CancellationToken)> {
        let mut waiting = self.waiting();
        let id = waiting.pop()?;
        let token = CancellationToken::new();
        self.running().insert(id, token.clone());
        self.inner.running_count.send_modify(|n| *n += 1);
        Some((id, token))
    }

    async fn run_task(&self, id: TaskId, cancel: CancellationToken) {
        if let Err(e) = self.run_task_inner(id, &cancel).await {
            tracing::error!(task_id = id.0, error = %e, "Failed to record transcode outcome");
        }
        self.running().remove(&id);
        self.inner
            .running_count
            .send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn run_task_inner(&self, id: TaskId, cancel: &CancellationToken) -> Result<()> {
        let Some(row) = self.inner.db.get_transcode_task(id).await? else {
            return Ok(());
        };
        if row.status() != TranscodeStatus::Queued {
            return Ok(());
        }

        let db = &self.inner.db;
        let job = row.job_id.map(JobId);
        let source = PathBuf::from(&row.source_path);
        let target = PathBuf::from(&row.target_path);

        db.mark_transcode_started(id).await?;
        self.emit(Event::TranscodeStarted { task: id });
        tracing::info!(
            task_id = id.0,
            source = %source.display(),
            encoder = self.inner.encoder.name(),
            "Transcode started"
        );

        match self.transcode(id, &source, &target, cancel).await {
            Ok(Transcoded::Encoded) => {
                db.finish_transcode_task(id, TranscodeStatus::Completed, None)
                    .await?;
                self.emit(Event::TranscodeCompleted {
                    task: id,
                    path: target.clone(),
                });
                tracing::info!(task_id = id.0, target = %target.display(), "Transcode completed");
                self.notify_finished(id, job, TranscodeOutcome::Completed(target));
            }
            Ok(Transcoded::Skipped(reason)) => {
                db.finish_transcode_task(id, TranscodeStatus::Skipped, None)
                    .await?;
                tracing::info!(task_id = id.0, %reason, "Transcode skipped");
                self.emit(Event::TranscodeSkipped { task: id, reason });
                self.notify_finished(id, job, TranscodeOutcome::Skipped(source));
            }
            Err(Error::Job(JobError::Cancelled)) if self.inner.shutdown.is_cancelled() => {
                db.requeue_transcode_task(
                    id,
                    row.retry_count.max(0) as u32,
                    row.error_message.as_deref(),
                    row.queue_seq,
                )
                .await?;
                tracing::info!(task_id = id.0, "Transcode interrupted by shutdown");
            }
            Err(Error::Job(JobError::Cancelled)) => {
                db.finish_transcode_task(id, TranscodeStatus::Cancelled, None)
                    .await?;
                self.emit(Event::TranscodeCancelled { task: id });
                tracing::info!(task_id = id.0, "Transcode cancelled");
                self.notify_finished(id, job, TranscodeOutcome::Cancelled);
            }
            Err(e) => {
                let message = e.to_string();
                let retries = row.retry_count.max(0) as u32;
                let retryable = !matches!(e, Error::NotFound(_) | Error::NotSupported(_));

                if retryable && retries < self.inner.config.max_retries {
                    let queue_seq = db.next_queue_seq();
                    db.requeue_transcode_task(id, retries + 1, Some(&message), queue_seq)
                        .await?;
                    self.waiting()
                        .push(id, Priority::new(i64::from(row.priority)), queue_seq);
                    self.inner.wake.notify_one();
                    tracing::warn!(
                        task_id = id.0,
                        retry = retries + 1,
                        error = %message,
                        "Transcode failed, requeued"
                    );
                } else {
                    db.finish_transcode_task(id, TranscodeStatus::Failed, Some(&message))
                        .await?;
                    self.emit(Event::TranscodeFailed {
                        task: id,
                        error: message.clone(),
                    });
                    tracing::error!(task_id = id.0, error = %message, "Transcode failed");
                    self.notify_finished(id, job, TranscodeOutcome::Failed(message));
                }
            }
        }
        Ok(())
    }

    async fn transcode(
        &self,
        id: TaskId,
        source: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<Transcoded> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::NotFound(format!(
                "transcode source {}",
                source.display()
            )));
        }

        let encoder = &self.inner.encoder;
        let profile = &self.inner.config.target;
        let probe = tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Cancelled.into()),
            probe = encoder.probe(source) => probe?,
        };
        if probe.satisfies(profile) {
            return Ok(Transcoded::Skipped(probe.skip_reason(profile)));
        }
        if let Some(duration) = probe.duration_secs {
            self.inner.db.set_transcode_duration(id, duration).await?;
        }

        let staging = staging_path(target)?;
        let event_tx = self.inner.event_tx.clone();
        let total = probe.duration_secs;
        let progress = move |position: Duration| {
            let percent =
                total.map(|total| (position.as_secs_f64() / total * 100.0).min(100.0) as f32);
            let _ = event_tx.send(Event::TranscodeProgress { task: id, percent });
        };

        if let Err(e) = encoder
            .encode(source, &staging, profile, &progress, cancel)
            .await
        {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }
        crate::utils::move_into_place(&staging, target).await?;

        if self.inner.config.delete_source
            && source != target
            && let Err(e) = tokio::fs::remove_file(source).await
        {
            tracing::warn!(source = %source.display(), error = %e, "Failed to remove transcode source");
        }
        Ok(Transcoded::Encoded)
    }

    async fn purge_logged(&self) {
        match self.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "Purged expired transcode tasks"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge transcode tasks"),
        }
    }

    async fn row(&self, id: TaskId) -> Result<TranscodeRow> {
        self.inner
            .db
            .get_transcode_task(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("transcode task {id}")))
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.event_tx.send(event);
    }

    fn notify_finished(&self, task: TaskId, job: Option<JobId>, outcome: TranscodeOutcome) {
        if let Some(tx) = &self.inner.finished_tx {
            let _ = tx.send(TranscodeFinished { task, job, outcome });
        }
    }

    fn waiting(&self) -> std::sync::MutexGuard<'_, AdmissionQueue<TaskId>> {
        self.inner
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output path for `source` under `profile`
///
/// Uses the profile's container as extension; when that would overwrite the
/// source, `.transcoded` is added before it.
pub(crate) fn target_path(source: &Path, profile: &TargetProfile) -> PathBuf {
    let extension = profile.container.to_ascii_lowercase();
    let candidate = source.with_extension(&extension);
    if candidate != source {
        return candidate;
    }
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    source.with_file_name(format!("{stem}.transcoded.{extension}"))
}

fn staging_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Other(format!("invalid transcode target {}", target.display())))?;
    Ok(target.with_file_name(format!(".{name}.transcoding")))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
