use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Scripted encoder: fixed probe result, optional failures or blocking
#[derive(Default)]
struct MockEncoder {
    probe: MediaProbe,
    failures: AtomicUsize,
    block_until_cancelled: bool,
    encoded: Mutex<Vec<PathBuf>>,
    started: Notify,
}

impl MockEncoder {
    fn needing_work(duration_secs: Option<f64>) -> Self {
        Self {
            probe: MediaProbe {
                duration_secs,
                formats: vec!["matroska".into(), "webm".into()],
                video_codec: Some("hevc".into()),
                audio_codec: Some("ac3".into()),
            },
            ..Default::default()
        }
    }

    fn encoded(&self) -> Vec<PathBuf> {
        self.encoded.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MediaEncoder for MockEncoder {
    async fn probe(&self, _source: &Path) -> Result<MediaProbe> {
        Ok(self.probe.clone())
    }

    async fn encode(
        &self,
        source: &Path,
        target: &Path,
        _profile: &TargetProfile,
        progress: EncodeProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.encoded.lock().unwrap().push(source.to_path_buf());
        self.started.notify_one();

        if self.block_until_cancelled {
            cancel.cancelled().await;
            return Err(JobError::Cancelled.into());
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transcode("encoder crashed".into()));
        }

        progress(Duration::from_secs(30));
        tokio::fs::write(target, b"encoded").await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct Harness {
    queue: TranscodeQueue,
    db: Arc<Database>,
    encoder: Arc<MockEncoder>,
    finished: mpsc::UnboundedReceiver<TranscodeFinished>,
    events: broadcast::Receiver<Event>,
    dir: TempDir,
}

async fn harness(encoder: MockEncoder, config: TranscodeConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&dir.path().join("test.db")).await.unwrap());
    let encoder = Arc::new(encoder);
    let (event_tx, events) = broadcast::channel(256);
    let (finished_tx, finished) = mpsc::unbounded_channel();
    let queue = TranscodeQueue::new(
        db.clone(),
        encoder.clone(),
        config,
        event_tx,
        Some(finished_tx),
    );
    Harness {
        queue,
        db,
        encoder,
        finished,
        events,
        dir,
    }
}

impl Harness {
    async fn source(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        tokio::fs::write(&path, b"source media").await.unwrap();
        path
    }

    async fn submit(&self, name: &str, priority: u8) -> TaskId {
        let source = self.source(name).await;
        self.queue
            .submit(TranscodeRequest {
                job_id: None,
                source,
                priority: Priority::from(priority),
                origin: TranscodeOrigin::WatchFolder,
            })
            .await
            .unwrap()
    }

    async fn next_finished(&mut self) -> TranscodeFinished {
        timeout(WAIT, self.finished.recv()).await.unwrap().unwrap()
    }

    fn drain_events(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

#[tokio::test]
async fn admits_by_priority_then_submission_order() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    h.submit("low.mkv", 10).await;
    h.submit("high.mkv", 90).await;
    h.submit("mid.mkv", 50).await;

    h.queue.start().await.unwrap();
    for _ in 0..3 {
        h.next_finished().await;
    }

    let order: Vec<_> = h
        .encoder
        .encoded()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(order, vec!["high.mkv", "mid.mkv", "low.mkv"]);
}

#[tokio::test]
async fn encode_moves_output_into_place_and_reports_percent() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    let id = h.submit("movie.mkv", 50).await;
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    let target = h.dir.path().join("movie.mp4");
    assert_eq!(finished.task, id);
    assert_eq!(finished.outcome, TranscodeOutcome::Completed(target.clone()));
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"encoded");
    assert!(!h.dir.path().join(".movie.mp4.transcoding").exists());
    assert!(h.dir.path().join("movie.mkv").exists(), "source kept by default");

    let info = h.queue.get(id).await.unwrap();
    assert_eq!(info.status, TranscodeStatus::Completed);
    assert_eq!(info.duration_secs, Some(60.0));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::TranscodeProgress { task, percent: Some(p) } if *task == id && (*p - 50.0).abs() < 0.01
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::TranscodeCompleted { task, .. } if *task == id)));
}

#[tokio::test]
async fn unknown_duration_reports_indeterminate_progress() {
    let mut h = harness(MockEncoder::needing_work(None), TranscodeConfig::default()).await;
    let id = h.submit("stream.ts", 50).await;
    h.queue.start().await.unwrap();
    h.next_finished().await;

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::TranscodeProgress { task, percent: None } if *task == id
    )));
}

#[tokio::test]
async fn matching_source_is_skipped_without_encoding() {
    let encoder = MockEncoder {
        probe: MediaProbe {
            duration_secs: Some(100.0),
            formats: vec!["mov".into(), "mp4".into(), "m4a".into()],
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
        },
        ..Default::default()
    };
    let mut h = harness(encoder, TranscodeConfig::default()).await;
    let id = h.submit("ready.mp4", 50).await;
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    assert_eq!(
        finished.outcome,
        TranscodeOutcome::Skipped(h.dir.path().join("ready.mp4"))
    );
    assert!(h.encoder.encoded().is_empty());
    assert_eq!(h.queue.get(id).await.unwrap().status, TranscodeStatus::Skipped);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, Event::TranscodeSkipped { task, .. } if *task == id)));
}

#[tokio::test]
async fn failures_are_retried_up_to_the_budget() {
    let encoder = MockEncoder::needing_work(Some(60.0));
    encoder.failures.store(usize::MAX, Ordering::SeqCst);
    let config = TranscodeConfig {
        max_retries: 1,
        ..Default::default()
    };
    let mut h = harness(encoder, config).await;
    let id = h.submit("broken.avi", 50).await;
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    assert!(matches!(finished.outcome, TranscodeOutcome::Failed(ref m) if m.contains("encoder crashed")));
    assert_eq!(h.encoder.encoded().len(), 2);

    let info = h.queue.get(id).await.unwrap();
    assert_eq!(info.status, TranscodeStatus::Failed);
    assert_eq!(info.retry_count, 1);
    assert!(!h.dir.path().join("broken.mp4").exists());
}

#[tokio::test]
async fn transient_failure_then_success_completes() {
    let encoder = MockEncoder::needing_work(Some(60.0));
    encoder.failures.store(1, Ordering::SeqCst);
    let mut h = harness(encoder, TranscodeConfig::default()).await;
    let id = h.submit("flaky.avi", 50).await;
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    assert!(matches!(finished.outcome, TranscodeOutcome::Completed(_)));
    assert_eq!(h.queue.get(id).await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn missing_source_fails_without_retry() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    let id = h
        .queue
        .submit(TranscodeRequest {
            job_id: None,
            source: h.dir.path().join("gone.mkv"),
            priority: Priority::default(),
            origin: TranscodeOrigin::WatchFolder,
        })
        .await
        .unwrap();
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    assert!(matches!(finished.outcome, TranscodeOutcome::Failed(_)));
    assert_eq!(h.queue.get(id).await.unwrap().retry_count, 0);
    assert!(h.encoder.encoded().is_empty());
}

#[tokio::test]
async fn cancel_interrupts_a_running_encode() {
    let encoder = MockEncoder {
        block_until_cancelled: true,
        ..MockEncoder::needing_work(Some(60.0))
    };
    let mut h = harness(encoder, TranscodeConfig::default()).await;
    let id = h.submit("long.mkv", 50).await;
    h.queue.start().await.unwrap();

    timeout(WAIT, h.encoder.started.notified()).await.unwrap();
    h.queue.cancel(id).await.unwrap();

    let finished = h.next_finished().await;
    assert_eq!(finished.outcome, TranscodeOutcome::Cancelled);
    assert_eq!(h.queue.get(id).await.unwrap().status, TranscodeStatus::Cancelled);
    assert!(!h.dir.path().join("long.mp4").exists());
}

#[tokio::test]
async fn cancel_of_a_waiting_task_never_encodes_it() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    let id = h.submit("queued.mkv", 50).await;
    h.queue.cancel(id).await.unwrap();
    h.queue.start().await.unwrap();

    let finished = h.next_finished().await;
    assert_eq!(finished.outcome, TranscodeOutcome::Cancelled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.encoder.encoded().is_empty());

    // A second cancel on a terminal task is a no-op
    h.queue.cancel(id).await.unwrap();
}

#[tokio::test]
async fn shutdown_returns_running_task_to_queue() {
    let encoder = MockEncoder {
        block_until_cancelled: true,
        ..MockEncoder::needing_work(Some(60.0))
    };
    let h = harness(encoder, TranscodeConfig::default()).await;
    let id = h.submit("interrupted.mkv", 50).await;
    h.queue.start().await.unwrap();
    timeout(WAIT, h.encoder.started.notified()).await.unwrap();

    h.queue.shutdown(WAIT).await;

    assert_eq!(h.queue.get(id).await.unwrap().status, TranscodeStatus::Queued);
    let err = h
        .queue
        .submit(TranscodeRequest {
            job_id: None,
            source: h.dir.path().join("late.mkv"),
            priority: Priority::default(),
            origin: TranscodeOrigin::WatchFolder,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

#[tokio::test]
async fn start_restores_tasks_interrupted_mid_encode() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    let source = h.source("restored.mkv").await;
    let id = h
        .db
        .insert_transcode_task(&NewTranscodeTask {
            job_id: None,
            source_path: source.clone(),
            target_path: target_path(&source, &TargetProfile::default()),
            priority: Priority::default(),
            queue_seq: 1,
            origin: TranscodeOrigin::WatchFolder,
        })
        .await
        .unwrap();
    h.db.mark_transcode_started(id).await.unwrap();

    h.queue.start().await.unwrap();
    let finished = h.next_finished().await;
    assert_eq!(finished.task, id);
    assert!(matches!(finished.outcome, TranscodeOutcome::Completed(_)));
}

#[tokio::test]
async fn priority_change_reorders_waiting_tasks() {
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), TranscodeConfig::default()).await;
    h.submit("first.mkv", 50).await;
    let second = h.submit("second.mkv", 50).await;
    h.queue.set_priority(second, Priority::new(80)).await.unwrap();

    h.queue.start().await.unwrap();
    h.next_finished().await;
    h.next_finished().await;

    let first_encoded = h.encoder.encoded()[0].clone();
    assert_eq!(first_encoded, h.dir.path().join("second.mkv"));
    assert_eq!(h.queue.get(second).await.unwrap().priority, Priority::new(80));
}

#[tokio::test]
async fn delete_source_removes_input_after_success() {
    let config = TranscodeConfig {
        delete_source: true,
        ..Default::default()
    };
    let mut h = harness(MockEncoder::needing_work(Some(60.0)), config).await;
    h.submit("consumed.avi", 50).await;
    h.queue.start().await.unwrap();
    h.next_finished().await;

    assert!(!h.dir.path().join("consumed.avi").exists());
    assert!(h.dir.path().join("consumed.mp4").exists());
}

#[test]
fn target_path_never_overwrites_the_source() {
    let profile = TargetProfile::default();
    assert_eq!(
        target_path(Path::new("/m/film.mkv"), &profile),
        PathBuf::from("/m/film.mp4")
    );
    assert_eq!(
        target_path(Path::new("/m/film.mp4"), &profile),
        PathBuf::from("/m/film.transcoded.mp4")
    );
}

#[test]
fn probe_satisfaction_requires_container_and_codecs() {
    let profile = TargetProfile::default();
    let mut probe = MediaProbe {
        duration_secs: None,
        formats: vec!["mov".into(), "mp4".into()],
        video_codec: Some("h264".into()),
        audio_codec: Some("aac".into()),
    };
    assert!(probe.satisfies(&profile));

    probe.audio_codec = None;
    assert!(probe.satisfies(&profile), "missing audio stream is fine");

    probe.video_codec = Some("hevc".into());
    assert!(!probe.satisfies(&profile));

    probe.video_codec = None;
    assert!(!probe.satisfies(&profile), "no streams at all");

    let mkv = MediaProbe {
        formats: vec!["matroska".into(), "webm".into()],
        video_codec: Some("h264".into()),
        audio_codec: Some("aac".into()),
        ..Default::default()
    };
    assert!(!mkv.satisfies(&profile));
    assert!(mkv.satisfies(&TargetProfile {
        container: "mkv".into(),
        ..Default::default()
    }));
}

#[tokio::test]
async fn purge_drops_expired_terminal_tasks_only() {
    let config = TranscodeConfig {
        task_retention: Duration::ZERO,
        ..Default::default()
    };
    let h = harness(MockEncoder::needing_work(Some(60.0)), config).await;
    let done = h.submit("done.mkv", 50).await;
    let waiting = h.submit("waiting.mkv", 50).await;
    h.db
        .finish_transcode_task(done, TranscodeStatus::Completed, None)
        .await
        .unwrap();

    // completed_at has second resolution
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.queue.purge_expired().await.unwrap(), 1);

    assert!(h.queue.get(done).await.is_err());
    assert_eq!(
        h.queue.get(waiting).await.unwrap().status,
        TranscodeStatus::Queued
    );
}
