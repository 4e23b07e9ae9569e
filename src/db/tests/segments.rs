use super::*;
use crate::nzb::{FileKind, NzbFile, NzbPlan, Segment};
use crate::types::SegmentStatus;

fn plan() -> NzbPlan {
    let file = |index: usize, count: usize| NzbFile {
        index,
        subject: format!("file{index}"),
        poster: "poster".into(),
        date: 0,
        groups: vec![],
        filename: format!("file{index}.bin"),
        kind: FileKind::Media,
        segments: (0..count)
            .map(|i| Segment {
                file_index: index,
                segment_index: i,
                number: i as u32 + 1,
                message_id: format!("f{index}s{i}@test"),
                bytes: 100,
            })
            .collect(),
    };
    NzbPlan {
        meta: Default::default(),
        files: vec![file(0, 3), file(1, 2)],
    }
}

fn done(file_index: usize, segment_index: usize) -> SegmentUpdate {
    SegmentUpdate {
        file_index,
        segment_index,
        status: SegmentStatus::Done,
        provider: Some("primary".into()),
        attempts: 1,
        last_error: None,
        file_size: Some(500),
        spool_path: Some(PathBuf::from(format!("/tmp/{file_index}-{segment_index}"))),
        part_offset: Some(segment_index as u64 * 500),
    }
}

#[tokio::test]
async fn segments_are_listed_in_plan_order() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    db.insert_segments(job, &plan()).await.unwrap();

    let rows = db.list_segments(job).await.unwrap();
    let ids: Vec<&str> = rows.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["f0s0@test", "f0s1@test", "f0s2@test", "f1s0@test", "f1s1@test"]
    );
    assert!(rows.iter().all(|r| r.status() == SegmentStatus::Pending));
}

#[tokio::test]
async fn batched_updates_are_applied() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    db.insert_segments(job, &plan()).await.unwrap();

    let failed = SegmentUpdate {
        status: SegmentStatus::Failed,
        provider: Some("backup".into()),
        attempts: 2,
        last_error: Some("not found".into()),
        file_size: None,
        spool_path: None,
        part_offset: None,
        ..done(1, 1)
    };
    db.apply_segment_updates(job, &[done(0, 1), failed])
        .await
        .unwrap();

    let rows = db.list_segments(job).await.unwrap();
    assert_eq!(rows[1].status(), SegmentStatus::Done);
    assert_eq!(rows[1].provider.as_deref(), Some("primary"));
    assert_eq!(rows[1].file_size, Some(500));
    assert_eq!(rows[1].spool_path.as_deref(), Some("/tmp/0-1"));
    assert_eq!(rows[1].part_offset, Some(500));
    assert_eq!(rows[4].part_offset, None);
    assert_eq!(rows[4].status(), SegmentStatus::Failed);
    assert_eq!(rows[4].attempts, 2);
    assert_eq!(rows[4].last_error.as_deref(), Some("not found"));
}

#[tokio::test]
async fn reinserting_keeps_existing_state() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    db.insert_segments(job, &plan()).await.unwrap();
    db.apply_segment_updates(job, &[done(0, 0)]).await.unwrap();

    db.insert_segments(job, &plan()).await.unwrap();

    let rows = db.list_segments(job).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].status(), SegmentStatus::Done);
}

#[tokio::test]
async fn reset_keeps_done_segments() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    db.insert_segments(job, &plan()).await.unwrap();
    let failed = SegmentUpdate {
        status: SegmentStatus::Failed,
        ..done(0, 2)
    };
    db.apply_segment_updates(job, &[done(0, 0), failed])
        .await
        .unwrap();

    let reset = db.reset_unfinished_segments(job).await.unwrap();
    assert_eq!(reset, 4);

    let rows = db.list_segments(job).await.unwrap();
    assert_eq!(rows[0].status(), SegmentStatus::Done);
    assert_eq!(rows[2].status(), SegmentStatus::Pending);
    assert_eq!(rows[2].attempts, 1, "attempt history survives a reset");
}

#[tokio::test]
async fn deleting_segments_clears_the_job() {
    let (db, _file) = open().await;
    let job = insert(&db, "movie", 50).await;
    db.insert_segments(job, &plan()).await.unwrap();

    db.delete_segments(job).await.unwrap();
    assert!(db.list_segments(job).await.unwrap().is_empty());
}
