//! Admission loop and per-job outcome handling.

use super::background_tasks::{ByteCounter, ProgressReporterParams, spawn_progress_reporter};
use super::{ActiveJob, DownloadManager};
use crate::db::JobRow;
use crate::error::{Error, JobError, Result};
use crate::http::TransferProgress;
use crate::transcode::TranscodeRequest;
use crate::types::{Event, JobId, JobSource, JobStatus, Priority, TranscodeOrigin};
use crate::utils::{move_into_place, sanitize_filename, unique_path};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How an attempt left the job
enum Delivery {
    /// Final media in place
    Completed(PathBuf),
    /// Handed to the transcode queue; the job finishes with its task
    Transcoding,
}

impl DownloadManager {
    /// Admit waiting jobs while download slots are free
    pub(super) async fn dispatch(self) {
        loop {
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = Arc::clone(&self.inner.slots).acquire_owned() => match permit {
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
                }
            };
            let Some((id, cancel, exit_tx)) = admitted else {
                break;
            };

            let manager = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                manager.run_job(id, cancel).await;
                drop(exit_tx);
            });
        }
        tracing::debug!("Job dispatcher stopped");
    }

    fn admit_next(&self) -> Option<(JobId, CancellationToken, watch::Sender<()>)> {
        let mut waiting = self.waiting();
        let id = waiting.pop()?;
        let cancel = CancellationToken::new();
        let (exit_tx, exited) = watch::channel(());
        self.active().insert(
            id,
            ActiveJob {
                cancel: cancel.clone(),
                exited,
            },
        );
        self.inner.active_count.send_modify(|n| *n += 1);
        Some((id, cancel, exit_tx))
    }

    pub(super) async fn run_job(&self, id: JobId, cancel: CancellationToken) {
        if let Err(e) = self.run_job_inner(id, &cancel).await {
            tracing::error!(job_id = id.0, error = %e, "Failed to record job outcome");
        }
        self.active().remove(&id);
        self.inner
            .active_count
            .send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn run_job_inner(&self, id: JobId, cancel: &CancellationToken) -> Result<()> {
        let Some(row) = self.inner.db.get_job(id).await? else {
            return Ok(());
        };
        // Admission is idempotent: only queued jobs start an attempt
        if row.status() != JobStatus::Queued {
            return Ok(());
        }

        let work_dir = self
            .inner
            .config
            .download
            .temp_dir
            .join(format!("job_{}", id.0));
        tokio::fs::create_dir_all(&work_dir).await?;
        self.inner.db.mark_job_started(id, &work_dir).await?;
        self.emit(Event::StageEntered {
            id,
            status: JobStatus::Downloading,
        });
        tracing::info!(
            job_id = id.0,
            name = %row.name,
            attempt = row.retry_count + 1,
            "Job started"
        );

        let attempt = match self.attempt(&row, &work_dir, cancel).await {
            // Cancelled during a stage that cannot be interrupted
            Ok(outputs) if cancel.is_cancelled() && !self.inner.shutdown.is_cancelled() => {
                for output in outputs {
                    let _ = tokio::fs::remove_file(output).await;
                }
                Err(JobError::Cancelled.into())
            }
            Ok(outputs) => self.deliver(&row, outputs).await,
            Err(e) => Err(e),
        };

        match attempt {
            Ok(Delivery::Completed(path)) => {
                self.inner
                    .db
                    .finish_job(id, JobStatus::Completed, None, Some(&path))
                    .await?;
                remove_work_dir(id, &work_dir).await;
                self.emit(Event::Completed {
                    id,
                    path: path.clone(),
                });
                tracing::info!(job_id = id.0, path = %path.display(), "Job completed");
            }
            Ok(Delivery::Transcoding) => {
                remove_work_dir(id, &work_dir).await;
            }
            Err(Error::Job(JobError::Cancelled)) if self.inner.shutdown.is_cancelled() => {
                // Spooled segments and partial transfers stay for the next start
                self.inner
                    .db
                    .requeue_job(
                        id,
                        row.retry_count.max(0) as u32,
                        row.error_message.as_deref(),
                        row.queue_seq,
                    )
                    .await?;
                tracing::info!(job_id = id.0, "Job interrupted by shutdown");
            }
            Err(Error::Job(JobError::Cancelled)) => {
                self.inner
                    .db
                    .finish_job(id, JobStatus::Cancelled, None, None)
                    .await?;
                remove_work_dir(id, &work_dir).await;
                self.emit(Event::Cancelled { id });
                tracing::info!(job_id = id.0, "Job cancelled");
            }
            Err(e) => self.attempt_failed(&row, &work_dir, e).await?,
        }
        Ok(())
    }

    async fn attempt(
        &self,
        row: &JobRow,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        match row.source()? {
            JobSource::Nzb { content } => self.acquire_nzb(row, &content, work_dir, cancel).await,
            JobSource::Http {
                url,
                simulate_playback,
                bitrate_bps,
            } => {
                let playback = simulate_playback.then(|| self.inner.http.playback_bitrate(bitrate_bps));
                self.acquire_http(row, &url, playback, work_dir, cancel)
                    .await
                    .map(|path| vec![path])
            }
        }
    }

    /// Stream an HTTP source into the work directory, then move it to its final path
    async fn acquire_http(
        &self,
        row: &JobRow,
        url: &str,
        playback_bps: Option<u64>,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let id = JobId(row.id);
        let progress = Arc::new(TransferProgress::default());
        let stop = CancellationToken::new();
        let reporter = spawn_progress_reporter(ProgressReporterParams {
            id,
            counter: ByteCounter::Transfer(Arc::clone(&progress)),
            interval: self.inner.config.download.progress_interval,
            event_tx: self.inner.event_tx.clone(),
            db: Arc::clone(&self.inner.db),
            stop: stop.clone(),
        });

        let transfer = self
            .inner
            .http
            .download(url, work_dir, playback_bps, &progress, cancel)
            .await;
        stop.cancel();
        if let Err(e) = reporter.await {
            tracing::error!(job_id = id.0, error = %e, "Progress reporter panicked");
        }
        let transfer = transfer?;

        let dest_dir = Path::new(&row.destination);
        tokio::fs::create_dir_all(dest_dir).await?;
        let target = unique_path(&dest_dir.join(sanitize_filename(&transfer.filename)))?;
        move_into_place(&transfer.path, &target).await?;
        Ok(target)
    }

    /// Complete the job or hand its media to the transcode queue
    async fn deliver(&self, row: &JobRow, outputs: Vec<PathBuf>) -> Result<Delivery> {
        let id = JobId(row.id);
        let primary = primary_output(&outputs).ok_or_else(|| {
            Error::Job(JobError::IntegrityMismatch(
                "job produced no output files".to_string(),
            ))
        })?;

        let Some(transcode) = &self.inner.transcode else {
            return Ok(Delivery::Completed(primary));
        };
        if row.transcode == 0 || !crate::watch_folder::is_media_file(&primary) {
            return Ok(Delivery::Completed(primary));
        }

        self.enter_stage(id, JobStatus::Transcoding).await?;
        transcode
            .submit(TranscodeRequest {
                job_id: Some(id),
                source: primary,
                priority: Priority::new(i64::from(row.priority)),
                origin: TranscodeOrigin::Download,
            })
            .await?;
        Ok(Delivery::Transcoding)
    }

    /// Requeue after a failed attempt, or fail once the retry budget is spent
    async fn attempt_failed(&self, row: &JobRow, work_dir: &Path, error: Error) -> Result<()> {
        let id = JobId(row.id);
        let message = error.to_string();
        let retries = row.retry_count.max(0) as u32;

        if self.inner.shutdown.is_cancelled() {
            // Failures caused by shutting down do not spend the retry budget
            self.inner
                .db
                .requeue_job(id, retries, Some(&message), row.queue_seq)
                .await?;
            tracing::info!(job_id = id.0, error = %message, "Job interrupted by shutdown");
            return Ok(());
        }

        if retries < self.inner.config.download.max_retries {
            let queue_seq = self.inner.db.next_queue_seq();
            self.inner
                .db
                .requeue_job(id, retries + 1, Some(&message), queue_seq)
                .await?;
            self.waiting()
                .push(id, Priority::new(i64::from(row.priority)), queue_seq);
            self.emit(Event::Requeued {
                id,
                retry_count: retries + 1,
                error: message.clone(),
            });
            tracing::warn!(
                job_id = id.0,
                retry = retries + 1,
                error = %message,
                "Job attempt failed, requeued"
            );
            self.inner.wake.notify_one();
            return Ok(());
        }

        self.inner
            .db
            .finish_job(id, JobStatus::Failed, Some(&message), None)
            .await?;
        let retains = matches!(&error, Error::Job(e) if e.retains_artifacts());
        if !retains {
            remove_work_dir(id, work_dir).await;
        }
        self.emit(Event::Failed {
            id,
            error: message.clone(),
            attempts: retries + 1,
        });
        tracing::error!(
            job_id = id.0,
            attempts = retries + 1,
            error = %message,
            "Job failed"
        );
        Ok(())
    }

    pub(super) async fn enter_stage(&self, id: JobId, status: JobStatus) -> Result<()> {
        self.inner.db.update_job_status(id, status).await?;
        self.emit(Event::StageEntered { id, status });
        tracing::info!(job_id = id.0, stage = %status, "Stage entered");
        Ok(())
    }
}

/// The file that represents the job: the largest media file, else the largest file
fn primary_output(outputs: &[PathBuf]) -> Option<PathBuf> {
    let size = |path: &PathBuf| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    outputs
        .iter()
        .filter(|p| crate::watch_folder::is_media_file(p))
        .max_by_key(|p| size(p))
        .or_else(|| outputs.iter().max_by_key(|p| size(p)))
        .cloned()
}

async fn remove_work_dir(id: JobId, work_dir: &Path) {
    if let Err(e) = crate::utils::remove_dir_if_exists(work_dir).await {
        tracing::warn!(job_id = id.0, error = %e, "Failed to remove work directory");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_output_prefers_largest_media_file() {
        let dir = tempfile::tempdir().unwrap();
        let nfo = dir.path().join("movie.nfo");
        let sample = dir.path().join("sample.mkv");
        let movie = dir.path().join("movie.mkv");
        std::fs::write(&nfo, vec![0u8; 4096]).unwrap();
        std::fs::write(&sample, vec![0u8; 16]).unwrap();
        std::fs::write(&movie, vec![0u8; 64]).unwrap();

        let picked = primary_output(&[nfo.clone(), sample, movie.clone()]);
        assert_eq!(picked, Some(movie));
        assert_eq!(primary_output(&[nfo.clone()]), Some(nfo));
        assert_eq!(primary_output(&[]), None);
    }
}
