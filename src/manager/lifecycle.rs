//! Startup restore, transcode handoff and graceful shutdown.

use super::DownloadManager;
use crate::db::JobRow;
use crate::error::{Error, Result};
use crate::transcode::{TranscodeFinished, TranscodeOutcome};
use crate::types::{Event, JobId, JobStatus, Priority, TaskId, TranscodeStatus};
use crate::watch_folder::FolderWatcher;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

impl DownloadManager {
    /// Restore unfinished jobs and begin admitting them
    ///
    /// Jobs interrupted mid-attempt go back to the queue at their original
    /// position without spending a retry. Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let finished_rx = self
            .inner
            .finished_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(rx) = finished_rx {
            tokio::spawn(self.clone().apply_transcode_outcomes(rx));
        }

        self.restore_jobs().await?;

        if let Some(transcode) = &self.inner.transcode {
            transcode.start().await?;
        }

        tokio::spawn(self.clone().dispatch());
        self.start_watch_folders()?;

        tracing::info!(
            max_concurrent_jobs = self.inner.config.download.max_concurrent_jobs,
            providers = self.provider_pool().len(),
            queued = self.queued_count(),
            "Download manager started"
        );
        Ok(())
    }

    async fn restore_jobs(&self) -> Result<()> {
        let rows = self.inner.db.list_unfinished_jobs().await?;
        let mut restored = 0usize;

        for row in rows {
            let id = JobId(row.id);
            let priority = Priority::new(i64::from(row.priority));
            match row.status() {
                JobStatus::Queued => {
                    self.waiting().push(id, priority, row.queue_seq);
                    restored += 1;
                }
                JobStatus::Downloading | JobStatus::Repairing | JobStatus::Extracting => {
                    self.inner
                        .db
                        .requeue_job(
                            id,
                            row.retry_count.max(0) as u32,
                            row.error_message.as_deref(),
                            row.queue_seq,
                        )
                        .await?;
                    self.waiting().push(id, priority, row.queue_seq);
                    tracing::info!(job_id = id.0, from = %row.status(), "Resuming interrupted job");
                    restored += 1;
                }
                JobStatus::Transcoding => self.restore_transcoding(&row).await?,
                _ => {}
            }
        }

        if restored > 0 {
            tracing::info!(restored, "Restored unfinished jobs");
        }
        Ok(())
    }

    /// Settle a job that was waiting on its transcode task when the process stopped
    async fn restore_transcoding(&self, row: &JobRow) -> Result<()> {
        let id = JobId(row.id);
        let Some(task) = self.inner.db.transcode_task_for_job(id).await? else {
            return self
                .apply_transcode_outcome(
                    id,
                    TranscodeOutcome::Failed("transcode task is missing".to_string()),
                )
                .await;
        };

        let outcome = match task.status() {
            // The transcode queue restores the task and reports its outcome
            TranscodeStatus::Queued | TranscodeStatus::Running
                if self.inner.transcode.is_some() =>
            {
                return Ok(());
            }
            TranscodeStatus::Queued | TranscodeStatus::Running => {
                // No encoder this run; deliver the untranscoded media
                self.inner
                    .db
                    .finish_transcode_task(
                        TaskId(task.id),
                        TranscodeStatus::Cancelled,
                        Some("no encoder available"),
                    )
                    .await?;
                tracing::warn!(
                    job_id = id.0,
                    task_id = task.id,
                    "No encoder available, completing job with untranscoded media"
                );
                TranscodeOutcome::Skipped(PathBuf::from(&task.source_path))
            }
            TranscodeStatus::Completed => {
                TranscodeOutcome::Completed(PathBuf::from(&task.target_path))
            }
            TranscodeStatus::Skipped => TranscodeOutcome::Skipped(PathBuf::from(&task.source_path)),
            TranscodeStatus::Failed => TranscodeOutcome::Failed(
                task.error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ),
            TranscodeStatus::Cancelled => TranscodeOutcome::Cancelled,
        };
        self.apply_transcode_outcome(id, outcome).await
    }

    async fn apply_transcode_outcomes(self, mut rx: mpsc::UnboundedReceiver<TranscodeFinished>) {
        while let Some(finished) = rx.recv().await {
            let Some(job) = finished.job else {
                continue;
            };
            if let Err(e) = self.apply_transcode_outcome(job, finished.outcome).await {
                tracing::error!(
                    job_id = job.0,
                    task_id = finished.task.0,
                    error = %e,
                    "Failed to record transcode outcome"
                );
            }
        }
    }

    /// Finish a job in the transcode stage with its task's outcome
    async fn apply_transcode_outcome(&self, id: JobId, outcome: TranscodeOutcome) -> Result<()> {
        let _finalize = self.inner.finalize.lock().await;
        let Some(row) = self.inner.db.get_job(id).await? else {
            return Ok(());
        };
        if row.status() != JobStatus::Transcoding {
            return Ok(());
        }

        match outcome {
            TranscodeOutcome::Completed(path) | TranscodeOutcome::Skipped(path) => {
                self.inner
                    .db
                    .finish_job(id, JobStatus::Completed, None, Some(&path))
                    .await?;
                self.emit(Event::Completed {
                    id,
                    path: path.clone(),
                });
                tracing::info!(job_id = id.0, path = %path.display(), "Job completed");
            }
            TranscodeOutcome::Failed(reason) => {
                let message = format!("transcode failed: {reason}");
                self.inner
                    .db
                    .finish_job(id, JobStatus::Failed, Some(&message), None)
                    .await?;
                let attempts = row.retry_count.max(0) as u32 + 1;
                self.emit(Event::Failed {
                    id,
                    error: message.clone(),
                    attempts,
                });
                tracing::error!(job_id = id.0, error = %message, "Job failed");
            }
            TranscodeOutcome::Cancelled => {
                self.inner
                    .db
                    .finish_job(id, JobStatus::Cancelled, None, None)
                    .await?;
                self.emit(Event::Cancelled { id });
                tracing::info!(job_id = id.0, "Job cancelled with its transcode task");
            }
        }
        Ok(())
    }

    fn start_watch_folders(&self) -> Result<()> {
        let folders = &self.inner.config.watch_folders;
        if folders.is_empty() {
            return Ok(());
        }
        let Some(transcode) = &self.inner.transcode else {
            tracing::warn!(
                folders = folders.len(),
                "Watch folders configured but no encoder is available"
            );
            return Ok(());
        };

        let mut watcher = FolderWatcher::new(transcode.clone(), folders.clone())?;
        watcher.start()?;
        tokio::spawn(watcher.run(self.inner.shutdown.child_token()));
        Ok(())
    }

    /// Stop admitting work and interrupt everything in flight
    ///
    /// Active jobs are signalled and given `cancel_timeout` to exit; they
    /// return to the queue and resume on the next start. Waiting jobs stay
    /// queued in the database.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.inner.shutdown.cancel();

        let tokens: Vec<_> = self
            .active()
            .values()
            .map(|job| job.cancel.clone())
            .collect();
        for token in &tokens {
            token.cancel();
        }

        let wait = self.inner.config.download.cancel_timeout;
        let mut count = self.inner.active_count.subscribe();
        if tokio::time::timeout(wait, count.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = *self.inner.active_count.borrow(),
                "Jobs still running after shutdown timeout"
            );
        }

        if let Some(transcode) = &self.inner.transcode {
            transcode.shutdown(wait).await;
        }

        self.emit(Event::Shutdown);
        self.inner.db.close().await;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
