//! Transcode task records.

use crate::types::{JobId, Priority, TaskId, TranscodeStatus};
use crate::Result;
use std::path::Path;

use super::{Database, NewTranscodeTask, TranscodeRow, query_failed};

const TASK_COLUMNS: &str = r#"
    id, job_id, source_path, target_path, status, priority, queue_seq,
    duration_secs, origin, error_message, retry_count, created_at,
    started_at, completed_at
"#;

impl Database {
    /// Insert a queued transcode task
    pub async fn insert_transcode_task(&self, task: &NewTranscodeTask) -> Result<TaskId> {
        let result = sqlx::query(
            r#"
            INSERT INTO transcode_tasks (
                job_id, source_path, target_path, status, priority, queue_seq, origin, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.job_id)
        .bind(task.source_path.to_string_lossy().into_owned())
        .bind(task.target_path.to_string_lossy().into_owned())
        .bind(TranscodeStatus::Queued.to_i32())
        .bind(i32::from(task.priority.get()))
        .bind(task.queue_seq)
        .bind(task.origin.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to insert transcode task"))?;
        Ok(TaskId(result.last_insert_rowid()))
    }

    /// Get a task by ID
    pub async fn get_transcode_task(&self, id: TaskId) -> Result<Option<TranscodeRow>> {
        let row = sqlx::query_as::<_, TranscodeRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transcode_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("Failed to get transcode task"))?;
        Ok(row)
    }

    /// All tasks in admission order
    pub async fn list_transcode_tasks(&self) -> Result<Vec<TranscodeRow>> {
        let rows = sqlx::query_as::<_, TranscodeRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transcode_tasks ORDER BY priority DESC, queue_seq ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list transcode tasks"))?;
        Ok(rows)
    }

    /// Tasks that have not reached a terminal state
    pub async fn list_unfinished_transcode_tasks(&self) -> Result<Vec<TranscodeRow>> {
        let rows = sqlx::query_as::<_, TranscodeRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transcode_tasks WHERE status IN (?, ?) \
             ORDER BY priority DESC, queue_seq ASC"
        ))
        .bind(TranscodeStatus::Queued.to_i32())
        .bind(TranscodeStatus::Running.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list unfinished transcode tasks"))?;
        Ok(rows)
    }

    /// The most recent task created for a job
    pub async fn transcode_task_for_job(&self, job: JobId) -> Result<Option<TranscodeRow>> {
        let row = sqlx::query_as::<_, TranscodeRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM transcode_tasks WHERE job_id = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_failed("Failed to find transcode task"))?;
        Ok(row)
    }

    /// Whether a task that is not failed or cancelled reads or writes `path`
    pub async fn has_transcode_task_for(&self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy().into_owned();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transcode_tasks \
             WHERE (source_path = ? OR target_path = ?) AND status NOT IN (?, ?)",
        )
        .bind(&path)
        .bind(&path)
        .bind(TranscodeStatus::Failed.to_i32())
        .bind(TranscodeStatus::Cancelled.to_i32())
        .fetch_one(&self.pool)
        .await
        .map_err(query_failed("Failed to check transcode source"))?;
        Ok(count > 0)
    }

    /// Mark a task as encoding
    pub async fn mark_transcode_started(&self, id: TaskId) -> Result<()> {
        sqlx::query("UPDATE transcode_tasks SET status = ?, started_at = ? WHERE id = ?")
            .bind(TranscodeStatus::Running.to_i32())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to mark transcode started"))?;
        Ok(())
    }

    /// Record the probed media duration
    pub async fn set_transcode_duration(&self, id: TaskId, duration_secs: f64) -> Result<()> {
        sqlx::query("UPDATE transcode_tasks SET duration_secs = ? WHERE id = ?")
            .bind(duration_secs)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to set transcode duration"))?;
        Ok(())
    }

    /// Move a task into a terminal state
    pub async fn finish_transcode_task(
        &self,
        id: TaskId,
        status: TranscodeStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_tasks SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status.to_i32())
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to finish transcode task"))?;
        Ok(())
    }

    /// Put a task back in the queue
    pub async fn requeue_transcode_task(
        &self,
        id: TaskId,
        retry_count: u32,
        error: Option<&str>,
        queue_seq: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transcode_tasks
            SET status = ?, retry_count = ?, error_message = ?, queue_seq = ?, started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(TranscodeStatus::Queued.to_i32())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(queue_seq)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to requeue transcode task"))?;
        Ok(())
    }

    /// Change a task's priority
    pub async fn set_transcode_priority(&self, id: TaskId, priority: Priority) -> Result<()> {
        sqlx::query("UPDATE transcode_tasks SET priority = ? WHERE id = ?")
            .bind(i32::from(priority.get()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to set transcode priority"))?;
        Ok(())
    }

    /// Delete terminal tasks that finished before `cutoff` (unix seconds)
    pub async fn purge_transcode_tasks_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM transcode_tasks WHERE status NOT IN (?, ?) AND completed_at < ?",
        )
        .bind(TranscodeStatus::Queued.to_i32())
        .bind(TranscodeStatus::Running.to_i32())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(query_failed("Failed to purge transcode tasks"))?;
        Ok(result.rows_affected())
    }
}
