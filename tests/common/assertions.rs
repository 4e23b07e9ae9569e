//! Event waiting helpers

use media_acquire::{Event, JobId, JobStatus};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default time a scenario may take
pub const WAIT: Duration = Duration::from_secs(15);

/// How a job ended
#[derive(Debug, PartialEq)]
pub enum WaitResult {
    /// Completed with its final media at this path
    Completed(PathBuf),
    /// Failed terminally
    Failed { error: String, attempts: u32 },
    /// Cancelled
    Cancelled,
    /// No terminal event within the timeout
    Timeout,
    /// Event channel closed or lagged
    ChannelClosed,
}

/// Wait for `id`'s terminal event
pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<Event>,
    id: JobId,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::Completed { id: got, path }) if got == id => {
                    return WaitResult::Completed(path);
                }
                Ok(Event::Failed {
                    id: got,
                    error,
                    attempts,
                }) if got == id => return WaitResult::Failed { error, attempts },
                Ok(Event::Cancelled { id: got }) if got == id => return WaitResult::Cancelled,
                Ok(_) => continue,
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;
    result.unwrap_or(WaitResult::Timeout)
}

/// Wait until `id` enters `stage`
pub async fn wait_for_stage(
    events: &mut broadcast::Receiver<Event>,
    id: JobId,
    stage: JobStatus,
    timeout: Duration,
) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::StageEntered { id: got, status }) if got == id && status == stage => {
                    return true;
                }
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

/// Job ids in the order they entered the downloading stage
pub async fn admission_order(
    events: &mut broadcast::Receiver<Event>,
    count: usize,
    timeout: Duration,
) -> Vec<JobId> {
    let mut admitted = Vec::with_capacity(count);
    let _ = tokio::time::timeout(timeout, async {
        while admitted.len() < count {
            match events.recv().await {
                Ok(Event::StageEntered {
                    id,
                    status: JobStatus::Downloading,
                }) => admitted.push(id),
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    })
    .await;
    admitted
}

/// Wait for the terminal event of every job in `ids`, in whatever order they finish
pub async fn wait_for_all_terminal(
    events: &mut broadcast::Receiver<Event>,
    ids: &[JobId],
    timeout: Duration,
) -> Vec<WaitResult> {
    let mut outcomes: Vec<Option<WaitResult>> = ids.iter().map(|_| None).collect();
    let _ = tokio::time::timeout(timeout, async {
        while outcomes.iter().any(Option::is_none) {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(_) => return,
            };
            let Some(index) = event
                .job_id()
                .and_then(|id| ids.iter().position(|candidate| *candidate == id))
            else {
                continue;
            };
            let outcome = match event {
                Event::Completed { path, .. } => WaitResult::Completed(path),
                Event::Failed {
                    error, attempts, ..
                } => WaitResult::Failed { error, attempts },
                Event::Cancelled { .. } => WaitResult::Cancelled,
                _ => continue,
            };
            outcomes[index] = Some(outcome);
        }
    })
    .await;
    outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or(WaitResult::Timeout))
        .collect()
}
