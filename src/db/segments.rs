//! Per-segment retrieval state for resume support.

use crate::nzb::NzbPlan;
use crate::types::{JobId, SegmentStatus};
use crate::Result;

use super::{Database, SegmentRow, SegmentUpdate, query_failed};

impl Database {
    /// Record every segment of `plan` as pending
    ///
    /// Segments already recorded for the job keep their state, so a restored job
    /// can call this again without losing progress.
    pub async fn insert_segments(&self, job: JobId, plan: &NzbPlan) -> Result<()> {
        // SQLite's default limit is 999 bind variables; 5 per segment
        const MAX_SEGMENTS_PER_BATCH: usize = 190;

        let segments: Vec<_> = plan.segments().collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin segment insert"))?;

        for chunk in segments.chunks(MAX_SEGMENTS_PER_BATCH) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT OR IGNORE INTO segments (job_id, file_index, segment_index, message_id, size_bytes) ",
            );
            builder.push_values(chunk, |mut b, segment| {
                b.push_bind(job)
                    .push_bind(segment.file_index as i64)
                    .push_bind(segment.segment_index as i64)
                    .push_bind(&segment.message_id)
                    .push_bind(segment.bytes as i64);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(query_failed("Failed to insert segments"))?;
        }

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit segments"))?;
        Ok(())
    }

    /// Every segment of a job in plan order
    pub async fn list_segments(&self, job: JobId) -> Result<Vec<SegmentRow>> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            r#"
            SELECT job_id, file_index, segment_index, message_id, size_bytes, status,
                   provider, attempts, last_error, file_size, spool_path, part_offset
            FROM segments
            WHERE job_id = ?
            ORDER BY file_index ASC, segment_index ASC
            "#,
        )
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed("Failed to list segments"))?;
        Ok(rows)
    }

    /// Apply a batch of state changes in one transaction
    pub async fn apply_segment_updates(&self, job: JobId, updates: &[SegmentUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(query_failed("Failed to begin segment update"))?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE segments
                SET status = ?, provider = ?, attempts = ?, last_error = ?,
                    file_size = COALESCE(?, file_size), spool_path = ?, part_offset = ?
                WHERE job_id = ? AND file_index = ? AND segment_index = ?
                "#,
            )
            .bind(update.status.to_i32())
            .bind(&update.provider)
            .bind(i64::from(update.attempts))
            .bind(&update.last_error)
            .bind(update.file_size.map(|s| s as i64))
            .bind(
                update
                    .spool_path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
            )
            .bind(update.part_offset.map(|o| o as i64))
            .bind(job)
            .bind(update.file_index as i64)
            .bind(update.segment_index as i64)
            .execute(&mut *tx)
            .await
            .map_err(query_failed("Failed to update segment"))?;
        }

        tx.commit()
            .await
            .map_err(query_failed("Failed to commit segment updates"))?;
        Ok(())
    }

    /// Return unfinished segments to `pending` before a new attempt
    ///
    /// `done` segments are kept so their spooled bytes are reused.
    pub async fn reset_unfinished_segments(&self, job: JobId) -> Result<u64> {
        let result = sqlx::query("UPDATE segments SET status = ? WHERE job_id = ? AND status != ?")
            .bind(SegmentStatus::Pending.to_i32())
            .bind(job)
            .bind(SegmentStatus::Done.to_i32())
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to reset segments"))?;
        Ok(result.rows_affected())
    }

    /// Forget a job's segment state
    pub async fn delete_segments(&self, job: JobId) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE job_id = ?")
            .bind(job)
            .execute(&self.pool)
            .await
            .map_err(query_failed("Failed to delete segments"))?;
        Ok(())
    }
}
