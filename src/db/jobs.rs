//! Download job records and queue ordering.

use crate::types::{JobId, JobSource, JobStatus, Priority};
use crate::Result;
use std::path::Path;
use std::sync::atomic::Ordering;

use super::{Database, JobRow, NewJob, query_failed};

const JOB_COLUMNS: &str = r#"
    id, name, source_kind, http_url, http_simulate, http_bitrate, nzb_content,
    nzb_hash, password, catalog_kind, catalog_id, destination, transcode,
    priority, queue_seq, status, total_bytes, downloaded_bytes, temp_path,
    final_path, error_message, retry_count, created_at, started_at, completed_at
"#;

impl Database {
    /// Insert a new job in `queued` state
    pub async fn insert_job(&self, job: &NewJob) -> Result<JobId> {
        let now = chrono::Utc::now().timestamp();
        let (http_url, http_simulate, http_bitrate, nzb_content) = match &job.source {
            JobSource::Http {
                url,
                simulate_playback,
                bitrate_bps,
            } => (
                Some(url.as_str()),
                i32::from(*simulate_playback),
                bitrate_bps.map(|b| b as i64),
                None,
            ),
            JobSource::Nzb { content } => (None, 0, None, Some(content.as_slice())),
        };

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                name, source_kind, http_url, http_simulate, http_bitrate, nzb_content,
                nzb_hash, password, catalog_kind, catalog_id, destination, transcode,
                priority, queue_seq, status, total_bytes, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.name)
        .bind(job.source.kind().as_str())
        .bind(http_url)
        .bind(http_simulate)
        .bind(http_bitrate)
        .bind(nzb_content)
        .bind(&job.nzb_hash)
        .bind(&job.password)
        .bind(job.catalog.map(|c| c.kind.as_str()))
        .bind(job.catalog.map(|c| c.id))
        .bind(job.destination.to_string_lossy().into_owned())
        .bind(i32::from(job.transcode))
        .bind(i32::from(job.priority.get()))
        .bind(job.queue_seq)
        .bind(JobStatus::Queued.to_i32())
        .bind(job.total_bytes as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to insert job"))?;

        Ok(JobId(result.last_insert_rowid()))
    }

    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_failed("Failed to get job"))?;
        Ok(row)
    }

    /// All jobs in admission order
    pub async fn list_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY priority DESC, queue_seq ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list jobs"))?;
        Ok(rows)
    }

    /// Jobs that have not reached a terminal state, in admission order
    pub async fn list_unfinished_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status NOT IN (?, ?, ?) \
             ORDER BY priority DESC, queue_seq ASC"
        ))
        .bind(JobStatus::Completed.to_i32())
        .bind(JobStatus::Failed.to_i32())
        .bind(JobStatus::Cancelled.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list unfinished jobs"))?;
        Ok(rows)
    }

    /// Claim the next queue position
    ///
    /// Positions are unique across jobs and transcode tasks and strictly
    /// increasing for the life of the handle.
    pub fn next_queue_seq(&self) -> i64 {
        self.queue_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Largest queue position stored by jobs or transcode tasks
    pub(super) async fn max_queue_seq(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(seq) FROM (SELECT MAX(queue_seq) AS seq FROM jobs \
             UNION ALL SELECT MAX(queue_seq) AS seq FROM transcode_tasks)",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(query_failed("Failed to read queue position"))?;
        Ok(max.unwrap_or(0))
    }

    /// A non-terminal job with the same NZB hash, if any
    pub async fn find_unfinished_by_hash(&self, hash: &str) -> Result<Option<JobId>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE nzb_hash = ? AND status NOT IN (?, ?, ?) LIMIT 1",
        )
        .bind(hash)
        .bind(JobStatus::Completed.to_i32())
        .bind(JobStatus::Failed.to_i32())
        .bind(JobStatus::Cancelled.to_i32())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("Failed to check duplicate"))?;
        Ok(id.map(JobId))
    }

    /// Record a stage transition
    pub async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
            .bind(status.to_i32())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to update job status"))?;
        Ok(())
    }

    /// Mark the start of an attempt
    pub async fn mark_job_started(&self, id: JobId, temp_path: &Path) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?, started_at = ?, temp_path = ? WHERE id = ?")
            .bind(JobStatus::Downloading.to_i32())
            .bind(chrono::Utc::now().timestamp())
            .bind(temp_path.to_string_lossy().into_owned())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to mark job started"))?;
        Ok(())
    }

    /// Record progress counters
    pub async fn update_job_progress(&self, id: JobId, downloaded: u64, total: u64) -> Result<()> {
        sqlx::query("UPDATE jobs SET downloaded_bytes = ?, total_bytes = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(total as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to update job progress"))?;
        Ok(())
    }

    /// Move a job into a terminal state
    pub async fn finish_job(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<&str>,
        final_path: Option<&Path>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, error_message = COALESCE(?, error_message),
                final_path = COALESCE(?, final_path), completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_i32())
        .bind(error)
        .bind(final_path.map(|p| p.to_string_lossy().into_owned()))
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to finish job"))?;
        Ok(())
    }

    /// Put a job back in the queue after a failed attempt
    pub async fn requeue_job(
        &self,
        id: JobId,
        retry_count: u32,
        error: Option<&str>,
        queue_seq: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, retry_count = ?, error_message = ?, queue_seq = ?, started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(JobStatus::Queued.to_i32())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(queue_seq)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to requeue job"))?;
        Ok(())
    }

    /// Change a job's priority
    pub async fn set_job_priority(&self, id: JobId, priority: Priority) -> Result<()> {
        sqlx::query("UPDATE jobs SET priority = ? WHERE id = ?")
            .bind(i32::from(priority.get()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to set job priority"))?;
        Ok(())
    }
}
