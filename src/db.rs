//! SQLite pool for the history store.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::Result;
use crate::migrate;

/// History writes come from one recorder per running process, so a few
/// connections are plenty.
const MAX_CONNECTIONS: u32 = 4;

/// Concurrent processes completing together wait for the write lock
/// instead of failing with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the history database at `path`, creating the file and its parent
/// folders when missing, and bring the schema up to date.
pub async fn open_history_db(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    migrate::run_migrations(&pool).await?;
    debug!(path = %path.display(), "history database ready");

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_folders_and_schema_once() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("deeper").join("history.sqlite");

        let pool = open_history_db(&path).await.unwrap();
        assert!(path.exists());
        sqlx::query("INSERT INTO history_events (id, task_id, started_at, completed_at) VALUES ('e', 't', 0, 0)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        // reopening keeps the data and does not fail on the existing schema
        let pool = open_history_db(&path).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM history_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn failed_data_needs_an_event() {
        let tmp = TempDir::new().unwrap();
        let pool = open_history_db(&tmp.path().join("history.sqlite")).await.unwrap();
        let orphan = sqlx::query("INSERT INTO failed_data (event_id, data_id) VALUES ('missing', 'x')")
            .execute(&pool)
            .await;
        assert!(orphan.is_err());
    }
}
