//! Queue control: enqueue, cancel, reprioritize and query jobs.

use super::DownloadManager;
use crate::config::ProviderConfig;
use crate::db::{JobRow, NewJob, SegmentRow};
use crate::error::{Error, Result};
use crate::nzb;
use crate::types::{Event, JobId, JobInfo, JobRequest, JobSource, JobStatus, Priority};
use crate::utils::filename_from_url;
use sha2::{Digest, Sha256};

impl DownloadManager {
    /// Add a job to the queue
    ///
    /// NZB documents are parsed and their segment plan persisted before the job
    /// becomes visible. An NZB identical to one that has not finished yet is
    /// rejected with [`Error::Duplicate`].
    pub async fn enqueue(&self, request: JobRequest) -> Result<JobId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let _intake = self.inner.intake.lock().await;

        let (plan, nzb_hash) = match &request.source {
            JobSource::Nzb { content } => {
                let plan = nzb::parse(content)?;
                let hash = format!("{:x}", Sha256::digest(content));
                if let Some(existing) = self.inner.db.find_unfinished_by_hash(&hash).await? {
                    return Err(Error::Duplicate(format!(
                        "identical NZB is already job {existing}"
                    )));
                }
                if self.provider_pool().is_empty() {
                    return Err(Error::Config {
                        message: "NZB jobs need at least one Usenet provider".to_string(),
                        key: Some("providers".to_string()),
                    });
                }
                (Some(plan), Some(hash))
            }
            JobSource::Http { url, .. } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| Error::Other(format!("invalid URL '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::NotSupported(format!(
                        "URL scheme '{}'",
                        parsed.scheme()
                    )));
                }
                (None, None)
            }
        };

        let name = request
            .name
            .clone()
            .or_else(|| plan.as_ref().and_then(nzb::NzbPlan::display_name))
            .unwrap_or_else(|| match &request.source {
                JobSource::Http { url, .. } => filename_from_url(url),
                JobSource::Nzb { .. } => "nzb".to_string(),
            });

        let queue_seq = self.inner.db.next_queue_seq();
        let id = self
            .inner
            .db
            .insert_job(&NewJob {
                name: name.clone(),
                source: request.source.clone(),
                nzb_hash,
                password: request.password.clone(),
                catalog: request.catalog,
                destination: request
                    .destination
                    .clone()
                    .unwrap_or_else(|| self.inner.config.download.download_dir.clone()),
                transcode: request.transcode,
                priority: request.priority,
                queue_seq,
                total_bytes: plan.as_ref().map_or(0, nzb::NzbPlan::total_bytes),
            })
            .await?;
        if let Some(plan) = &plan {
            self.inner.db.insert_segments(id, plan).await?;
        }

        self.waiting().push(id, request.priority, queue_seq);
        self.emit(Event::Queued {
            id,
            name: name.clone(),
        });
        tracing::info!(
            job_id = id.0,
            name = %name,
            source = request.source.kind().as_str(),
            priority = request.priority.get(),
            segments = plan.as_ref().map_or(0, nzb::NzbPlan::segment_count),
            "Job queued"
        );
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Cancel a job
    ///
    /// A waiting job is cancelled immediately. An active job is signalled and the
    /// call returns once the job acknowledges, or fails after `cancel_timeout`.
    /// Cancelling a job that already finished is a no-op.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let row = self.row(id).await?;
        if row.status().is_terminal() {
            return Ok(());
        }

        let running = {
            let mut waiting = self.waiting();
            waiting.remove(id);
            self.active()
                .get(&id)
                .map(|job| (job.cancel.clone(), job.exited.clone()))
        };

        if let Some((token, mut exited)) = running {
            tracing::info!(job_id = id.0, "Cancelling active job");
            token.cancel();
            let timeout = self.inner.config.download.cancel_timeout;
            if tokio::time::timeout(timeout, exited.changed()).await.is_err() {
                tracing::warn!(job_id = id.0, ?timeout, "Job did not acknowledge cancellation");
                return Err(Error::Other(format!(
                    "job {id} did not acknowledge cancellation within {timeout:?}"
                )));
            }
        }

        // The job task has exited or never ran; finish whatever it left behind
        let _finalize = self.inner.finalize.lock().await;
        let row = self.row(id).await?;
        if row.status().is_terminal() {
            return Ok(());
        }
        self.inner
            .db
            .finish_job(id, JobStatus::Cancelled, None, None)
            .await?;
        if row.status() == JobStatus::Transcoding
            && let Some(transcode) = &self.inner.transcode
        {
            transcode.cancel_for_job(id).await?;
        }
        self.discard_temp(&row).await;
        self.emit(Event::Cancelled { id });
        tracing::info!(job_id = id.0, from = %row.status(), "Job cancelled");
        Ok(())
    }

    /// Change a job's priority
    ///
    /// A waiting job moves within the queue but keeps its place among jobs of
    /// the new priority. A job in the transcode stage reprioritizes its task.
    pub async fn set_priority(&self, id: JobId, priority: impl Into<Priority>) -> Result<()> {
        let priority = priority.into();
        let row = self.row(id).await?;
        if row.status().is_terminal() {
            return Ok(());
        }

        self.inner.db.set_job_priority(id, priority).await?;
        self.waiting().reprioritize(id, priority);

        if row.status() == JobStatus::Transcoding
            && let Some(transcode) = &self.inner.transcode
            && let Some(task) = self.inner.db.transcode_task_for_job(id).await?
        {
            transcode
                .set_priority(crate::types::TaskId(task.id), priority)
                .await?;
        }
        tracing::debug!(job_id = id.0, priority = priority.get(), "Job reprioritized");
        Ok(())
    }

    /// Snapshot of one job
    pub async fn get_job(&self, id: JobId) -> Result<JobInfo> {
        Ok(self.row(id).await?.to_info())
    }

    /// Snapshot of every job, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let rows = self.inner.db.list_jobs().await?;
        Ok(rows.iter().map(JobRow::to_info).collect())
    }

    /// Per-segment retrieval state of an NZB job
    pub async fn job_segments(&self, id: JobId) -> Result<Vec<SegmentRow>> {
        self.row(id).await?;
        self.inner.db.list_segments(id).await
    }

    /// Number of jobs waiting for a download slot
    pub fn queued_count(&self) -> usize {
        self.waiting().len()
    }

    /// Replace the configuration of the provider named `config.name`
    ///
    /// Fetches in flight finish on their current session; later fetches use
    /// the new settings. The change is persisted and survives a restart.
    pub async fn update_provider(&self, config: ProviderConfig) -> Result<()> {
        let pool = self.provider_pool();
        let id = pool
            .find(&config.name)
            .ok_or_else(|| Error::NotFound(format!("provider '{}'", config.name)))?;
        pool.update_provider(id, config.clone())?;
        self.inner.db.upsert_provider(&config).await
    }

    pub(super) async fn row(&self, id: JobId) -> Result<JobRow> {
        self.inner
            .db
            .get_job(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Remove a job's working directory, keeping nothing
    pub(super) async fn discard_temp(&self, row: &JobRow) {
        let Some(temp) = row.temp_path.as_deref() else {
            return;
        };
        if let Err(e) = crate::utils::remove_dir_if_exists(std::path::Path::new(temp)).await {
            tracing::warn!(job_id = row.id, error = %e, "Failed to remove temp directory");
        }
    }
}
