//! Per-job event streams.

use super::DownloadManager;
use crate::db::JobRow;
use crate::error::Result;
use crate::types::{Event, JobId, JobStatus};
use futures::stream::{self, BoxStream, StreamExt};
use std::future::ready;
use std::path::PathBuf;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Live half of a job stream; `done` is set once the last item went out
struct LiveEvents {
    manager: DownloadManager,
    id: JobId,
    events: BroadcastStream<Event>,
    done: bool,
}

impl DownloadManager {
    /// Stream the events of one job, starting with a snapshot of its state
    ///
    /// The first item reflects the job as stored: the stage it is in, or its
    /// terminal event if it already finished. The stream ends with the job's
    /// terminal event, or when the manager shuts down.
    pub async fn job_events(&self, id: JobId) -> Result<BoxStream<'static, Event>> {
        // Subscribe before reading the row so no transition falls in between
        let receiver = self.subscribe();
        let snapshot = snapshot(&self.row(id).await?);
        if snapshot.is_job_terminal() {
            return Ok(stream::once(ready(snapshot)).boxed());
        }

        let live = stream::unfold(
            LiveEvents {
                manager: self.clone(),
                id,
                events: BroadcastStream::new(receiver),
                done: false,
            },
            |mut live| async move {
                if live.done {
                    return None;
                }
                let event = live.next_event().await?;
                live.done = event.is_job_terminal() || matches!(event, Event::Shutdown);
                Some((event, live))
            },
        );

        Ok(stream::once(ready(snapshot)).chain(live).boxed())
    }
}

impl LiveEvents {
    async fn next_event(&mut self) -> Option<Event> {
        while let Some(item) = self.events.next().await {
            match item {
                Ok(event) if event.job_id() == Some(self.id) => return Some(event),
                Ok(Event::Shutdown) => return Some(Event::Shutdown),
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(job_id = self.id.0, skipped, "Job event stream lagged");
                    // The skipped events may have held the terminal one
                    if let Ok(row) = self.manager.row(self.id).await {
                        let current = snapshot(&row);
                        if current.is_job_terminal() {
                            return Some(current);
                        }
                    }
                }
            }
        }
        None
    }
}

/// The event describing a stored job's current state
fn snapshot(row: &JobRow) -> Event {
    let id = JobId(row.id);
    match row.status() {
        JobStatus::Completed => Event::Completed {
            id,
            path: row.final_path.as_deref().map(PathBuf::from).unwrap_or_default(),
        },
        JobStatus::Failed => Event::Failed {
            id,
            error: row.error_message.clone().unwrap_or_default(),
            attempts: row.retry_count.max(0) as u32 + 1,
        },
        JobStatus::Cancelled => Event::Cancelled { id },
        status => Event::StageEntered { id, status },
    }
}
