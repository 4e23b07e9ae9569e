//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use super::Database;

const SCHEMA_V1: &[(&str, &str)] = &[
    (
        "jobs table",
        r#"
        CREATE TABLE jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            http_url TEXT,
            http_simulate INTEGER NOT NULL DEFAULT 0,
            http_bitrate INTEGER,
            nzb_content BLOB,
            nzb_hash TEXT,
            password TEXT,
            catalog_kind TEXT,
            catalog_id INTEGER,
            destination TEXT NOT NULL,
            transcode INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 50,
            queue_seq INTEGER NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            total_bytes INTEGER NOT NULL DEFAULT 0,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            temp_path TEXT,
            final_path TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
    ),
    (
        "jobs status index",
        "CREATE INDEX idx_jobs_status ON jobs(status)",
    ),
    (
        "jobs queue index",
        "CREATE INDEX idx_jobs_queue ON jobs(priority DESC, queue_seq ASC)",
    ),
    (
        "jobs hash index",
        "CREATE INDEX idx_jobs_nzb_hash ON jobs(nzb_hash)",
    ),
    (
        "segments table",
        r#"
        CREATE TABLE segments (
            job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            file_index INTEGER NOT NULL,
            segment_index INTEGER NOT NULL,
            message_id TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            provider TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            file_size INTEGER,
            spool_path TEXT,
            part_offset INTEGER,
            PRIMARY KEY (job_id, file_index, segment_index)
        )
        "#,
    ),
    (
        "segments status index",
        "CREATE INDEX idx_segments_status ON segments(job_id, status)",
    ),
    (
        "providers table",
        r#"
        CREATE TABLE providers (
            name TEXT PRIMARY KEY,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            tls INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            connections INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            enabled INTEGER NOT NULL,
            retention_days INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "transcode_tasks table",
        r#"
        CREATE TABLE transcode_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id INTEGER REFERENCES jobs(id) ON DELETE SET NULL,
            source_path TEXT NOT NULL,
            target_path TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 50,
            queue_seq INTEGER NOT NULL,
            duration_secs REAL,
            origin TEXT NOT NULL,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER
        )
        "#,
    ),
    (
        "transcode_tasks status index",
        "CREATE INDEX idx_transcode_status ON transcode_tasks(status, completed_at)",
    ),
    (
        "transcode_tasks source index",
        "CREATE INDEX idx_transcode_source ON transcode_tasks(source_path)",
    ),
];

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self {
            pool,
            queue_seq: AtomicI64::new(0),
        };
        db.run_migrations().await?;
        let last = db.max_queue_seq().await?;
        db.queue_seq.store(last, Ordering::SeqCst);
        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?;

        if current_version.unwrap_or(0) < 1 {
            Self::apply_migration(&mut conn, 1, SCHEMA_V1).await?;
        }

        Ok(())
    }

    /// Apply one schema version inside a transaction
    ///
    /// A failing statement rolls the whole version back, so the database is
    /// never left half-migrated.
    async fn apply_migration(
        conn: &mut SqliteConnection,
        version: i64,
        statements: &[(&str, &str)],
    ) -> Result<()> {
        tracing::info!(version, "Applying database migration");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            for (what, sql) in statements {
                sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "Failed to create {what}: {e}"
                    )))
                })?;
            }
            Self::record_migration(conn, version).await
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{version}: {e}"
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "Database migration complete");
        Ok(())
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
