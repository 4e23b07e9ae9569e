//! Background tasks for progress reporting and batched segment state writes.

use crate::db::{Database, SegmentUpdate};
use crate::http::TransferProgress;
use crate::types::{Event, JobId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Batch size threshold for flushing segment updates to the database
const SEGMENT_BATCH_SIZE: usize = 100;

/// Interval between flushes of a partial batch
const SEGMENT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Where a job's byte counters live
#[derive(Clone)]
pub(super) enum ByteCounter {
    /// Segment retrieval: bytes decoded so far against the plan's declared total
    Segments { downloaded: Arc<AtomicU64>, total: u64 },
    /// HTTP transfer: counters maintained by the downloader
    Transfer(Arc<TransferProgress>),
}

impl ByteCounter {
    fn read(&self) -> (u64, u64) {
        match self {
            ByteCounter::Segments { downloaded, total } => {
                (downloaded.load(Ordering::Relaxed), *total)
            }
            ByteCounter::Transfer(progress) => (progress.downloaded(), progress.total()),
        }
    }
}

/// Parameters for spawning a progress reporter
pub(super) struct ProgressReporterParams {
    pub id: JobId,
    pub counter: ByteCounter,
    pub interval: Duration,
    pub event_tx: broadcast::Sender<Event>,
    pub db: Arc<Database>,
    pub stop: CancellationToken,
}

/// Spawn a task that periodically records and announces a job's progress
///
/// A final report is made when `stop` fires.
pub(super) fn spawn_progress_reporter(params: ProgressReporterParams) -> tokio::task::JoinHandle<()> {
    let ProgressReporterParams {
        id,
        counter,
        interval,
        event_tx,
        db,
        stop,
    } = params;

    tokio::spawn(async move {
        let started = Instant::now();
        let (baseline, _) = counter.read();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let stopping = tokio::select! {
                _ = ticker.tick() => false,
                _ = stop.cancelled() => true,
            };

            let (downloaded, total) = counter.read();
            let percent = if total > 0 {
                (downloaded as f32 / total as f32 * 100.0).min(100.0)
            } else {
                0.0
            };
            let elapsed = started.elapsed().as_secs_f64();
            let speed_bps = if elapsed > 0.0 {
                (downloaded.saturating_sub(baseline) as f64 / elapsed) as u64
            } else {
                0
            };

            if let Err(e) = db.update_job_progress(id, downloaded, total).await {
                tracing::error!(job_id = id.0, error = %e, "Failed to update progress");
            }
            event_tx
                .send(Event::Progress {
                    id,
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                    percent,
                    speed_bps,
                })
                .ok();

            if stopping {
                break;
            }
        }
    })
}

/// Spawn the task that owns a job's segment state writes
///
/// Updates are buffered and written in batches; everything still buffered is
/// written once the sending side is dropped.
pub(super) fn spawn_segment_writer(
    id: JobId,
    db: Arc<Database>,
    mut rx: mpsc::UnboundedReceiver<SegmentUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = Vec::with_capacity(SEGMENT_BATCH_SIZE);
        let mut interval = tokio::time::interval(SEGMENT_FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                update = rx.recv() => {
                    let Some(update) = update else {
                        break;
                    };
                    buffer.push(update);
                    if buffer.len() >= SEGMENT_BATCH_SIZE {
                        flush(id, &db, &mut buffer).await;
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush(id, &db, &mut buffer).await;
                    }
                }
            }
        }

        if !buffer.is_empty() {
            flush(id, &db, &mut buffer).await;
        }
    })
}

async fn flush(id: JobId, db: &Database, buffer: &mut Vec<SegmentUpdate>) {
    if let Err(e) = db.apply_segment_updates(id, buffer).await {
        tracing::error!(
            job_id = id.0,
            batch_size = buffer.len(),
            error = %e,
            "Failed to write segment updates"
        );
    }
    buffer.clear();
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewJob;
    use crate::types::{JobSource, Priority, SegmentStatus};

    async fn setup() -> (Arc<Database>, JobId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).await.unwrap());
        let id = db
            .insert_job(&NewJob {
                name: "job".to_string(),
                source: JobSource::Http {
                    url: "http://example.com/a.mkv".to_string(),
                    simulate_playback: false,
                    bitrate_bps: None,
                },
                nzb_hash: None,
                password: None,
                catalog: None,
                destination: dir.path().to_path_buf(),
                transcode: false,
                priority: Priority::default(),
                queue_seq: 1,
                total_bytes: 1000,
            })
            .await
            .unwrap();
        (db, id, dir)
    }

    #[tokio::test]
    async fn reporter_emits_final_progress_when_stopped() {
        let (db, id, _dir) = setup().await;
        let (event_tx, mut events) = broadcast::channel(16);
        let downloaded = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();

        let handle = spawn_progress_reporter(ProgressReporterParams {
            id,
            counter: ByteCounter::Segments {
                downloaded: Arc::clone(&downloaded),
                total: 1000,
            },
            interval: Duration::from_secs(3600),
            event_tx,
            db: Arc::clone(&db),
            stop: stop.clone(),
        });

        // First tick fires immediately
        let first = events.recv().await.unwrap();
        assert!(matches!(first, Event::Progress { downloaded_bytes: 0, .. }));

        downloaded.store(250, Ordering::Relaxed);
        stop.cancel();
        handle.await.unwrap();

        let last = events.recv().await.unwrap();
        match last {
            Event::Progress {
                downloaded_bytes,
                total_bytes,
                percent,
                ..
            } => {
                assert_eq!(downloaded_bytes, 250);
                assert_eq!(total_bytes, 1000);
                assert!((percent - 25.0).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let row = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(row.downloaded_bytes, 250);
    }

    #[tokio::test]
    async fn writer_flushes_remaining_updates_when_sender_drops() {
        let (db, id, _dir) = setup().await;
        let plan = crate::nzb::parse(
            br#"<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
              <file poster="p" date="1" subject="&quot;a.mkv&quot; yEnc (1/2)">
                <groups><group>alt.binaries.test</group></groups>
                <segments>
                  <segment bytes="10" number="1">a1@test</segment>
                  <segment bytes="10" number="2">a2@test</segment>
                </segments>
              </file>
            </nzb>"#,
        )
        .unwrap();
        db.insert_segments(id, &plan).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_segment_writer(id, Arc::clone(&db), rx);
        tx.send(SegmentUpdate {
            file_index: 0,
            segment_index: 1,
            status: SegmentStatus::Done,
            provider: Some("primary".to_string()),
            attempts: 2,
            last_error: None,
            file_size: Some(20),
            spool_path: None,
            part_offset: None,
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let segments = db.list_segments(id).await.unwrap();
        assert_eq!(segments[0].status(), SegmentStatus::Pending);
        assert_eq!(segments[1].status(), SegmentStatus::Done);
        assert_eq!(segments[1].attempts, 2);
        assert_eq!(segments[1].provider.as_deref(), Some("primary"));
    }
}
