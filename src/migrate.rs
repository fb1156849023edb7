use sqlx::SqlitePool;

use crate::error::Result;

/// Create the history schema. Safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history_events (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            acquired INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            failed_to_harvest INTEGER NOT NULL DEFAULT 0,
            failed_to_publish INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS failed_data (
            event_id TEXT NOT NULL,
            data_id TEXT NOT NULL,
            UNIQUE(event_id, data_id),
            FOREIGN KEY (event_id) REFERENCES history_events(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_events_task_id ON history_events(task_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_history_events_started_at ON history_events(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
