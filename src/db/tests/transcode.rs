use super::*;
use crate::types::{TranscodeOrigin, TranscodeStatus};
use std::path::Path;

fn task(job_id: Option<JobId>, source: &str, priority: u8, queue_seq: i64) -> NewTranscodeTask {
    NewTranscodeTask {
        job_id,
        source_path: PathBuf::from(source),
        target_path: PathBuf::from(format!("{source}.mp4")),
        priority: Priority::from(priority),
        queue_seq,
        origin: if job_id.is_some() {
            TranscodeOrigin::Download
        } else {
            TranscodeOrigin::WatchFolder
        },
    }
}

#[tokio::test]
async fn task_lifecycle_is_recorded() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    let id = db
        .insert_transcode_task(&task(Some(job), "/media/movie.mkv", 50, 1))
        .await
        .unwrap();

    db.mark_transcode_started(id).await.unwrap();
    db.set_transcode_duration(id, 5400.0).await.unwrap();
    db.finish_transcode_task(id, TranscodeStatus::Completed, None)
        .await
        .unwrap();

    let info = db.get_transcode_task(id).await.unwrap().unwrap().to_info();
    assert_eq!(info.status, TranscodeStatus::Completed);
    assert_eq!(info.job_id, Some(job));
    assert_eq!(info.duration_secs, Some(5400.0));
    assert_eq!(info.origin, TranscodeOrigin::Download);
    assert!(info.started_at.is_some() && info.completed_at.is_some());

    let latest = db.transcode_task_for_job(job).await.unwrap().unwrap();
    assert_eq!(latest.id, id.0);
}

#[tokio::test]
async fn unfinished_tasks_and_source_lookup() {
    let (db, _file) = open().await;
    let queued = db
        .insert_transcode_task(&task(None, "/watch/a.avi", 10, 1))
        .await
        .unwrap();
    let failed = db
        .insert_transcode_task(&task(None, "/watch/b.avi", 90, 2))
        .await
        .unwrap();
    db.finish_transcode_task(failed, TranscodeStatus::Failed, Some("codec"))
        .await
        .unwrap();

    let unfinished = db.list_unfinished_transcode_tasks().await.unwrap();
    assert_eq!(unfinished.len(), 1);
    assert_eq!(unfinished[0].id, queued.0);

    assert!(db.has_transcode_task_for(Path::new("/watch/a.avi")).await.unwrap());
    assert!(!db.has_transcode_task_for(Path::new("/watch/b.avi")).await.unwrap());
}

#[tokio::test]
async fn purge_removes_only_old_terminal_tasks() {
    let (db, _file) = open().await;
    let old = db
        .insert_transcode_task(&task(None, "/watch/old.avi", 50, 1))
        .await
        .unwrap();
    let running = db
        .insert_transcode_task(&task(None, "/watch/run.avi", 50, 2))
        .await
        .unwrap();
    db.finish_transcode_task(old, TranscodeStatus::Skipped, None)
        .await
        .unwrap();
    db.mark_transcode_started(running).await.unwrap();

    let future = chrono::Utc::now().timestamp() + 60;
    assert_eq!(db.purge_transcode_tasks_before(future).await.unwrap(), 1);
    assert!(db.get_transcode_task(old).await.unwrap().is_none());
    assert!(db.get_transcode_task(running).await.unwrap().is_some());
}

#[tokio::test]
async fn requeue_and_priority() {
    let (db, _file) = open().await;
    let id = db
        .insert_transcode_task(&task(None, "/watch/a.avi", 50, 1))
        .await
        .unwrap();
    db.mark_transcode_started(id).await.unwrap();
    db.requeue_transcode_task(id, 1, Some("encoder crashed"), 7)
        .await
        .unwrap();
    db.set_transcode_priority(id, Priority::from(80)).await.unwrap();

    let row = db.get_transcode_task(id).await.unwrap().unwrap();
    assert_eq!(row.status(), TranscodeStatus::Queued);
    assert_eq!(row.queue_seq, 7);
    assert_eq!(row.priority, 80);
    assert_eq!(row.retry_count, 1);
}
