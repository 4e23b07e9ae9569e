use crate::db::*;
use crate::types::{JobId, JobSource, Priority};
use std::path::PathBuf;
use tempfile::NamedTempFile;

mod segments;
mod transcode;

/// Fresh database in a temp file; keep the file alive for the test's duration
async fn open() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

fn nzb_job(name: &str, priority: u8, queue_seq: i64) -> NewJob {
    NewJob {
        name: name.to_string(),
        source: JobSource::Nzb {
            content: format!("<nzb>{name}</nzb>").into_bytes(),
        },
        nzb_hash: Some(format!("hash-{name}")),
        password: None,
        catalog: None,
        destination: PathBuf::from("/downloads"),
        transcode: true,
        priority: Priority::from(priority),
        queue_seq,
        total_bytes: 1000,
    }
}

async fn insert(db: &Database, name: &str, priority: u8) -> JobId {
    let seq = db.next_queue_seq();
    db.insert_job(&nzb_job(name, priority, seq)).await.unwrap()
}
