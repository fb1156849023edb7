//! Harvest history: one [`Event`] per completed run of a stored task,
//! with the run's [`Report`] counters and the ids of records that failed to
//! publish.
//!
//! Two backends implement [`HistoryManager`]: [`MemHistoryManager`] keeps
//! everything in memory, [`SqliteHistoryManager`] persists to SQLite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};
use uuid::Uuid;

use crate::crud::MemCrud;
use crate::error::{HarvestError, Result, Stage};
use crate::models::{DataReference, PublishingStatus};
use crate::process::{ProcessInfo, ProcessListener, ProcessStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub acquired: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub failed_to_harvest: u64,
    pub failed_to_publish: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub uuid: Uuid,
    pub task_id: Uuid,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub report: Report,
}

/// Events of one task.
#[derive(Debug, Clone, Default)]
pub struct History(pub Vec<Event>);

impl History {
    /// The event with the latest start.
    pub fn last_event(&self) -> Option<&Event> {
        self.0.iter().max_by_key(|e| e.started)
    }

    pub fn events(&self) -> &[Event] {
        &self.0
    }
}

#[async_trait]
pub trait HistoryManager: Send + Sync {
    async fn create(&self, event: Event) -> Result<Uuid>;

    async fn build_history(&self, task_id: Uuid) -> Result<History>;

    /// Remove every event of a task along with its failed data ids.
    async fn purge_history(&self, task_id: Uuid) -> Result<()>;

    async fn store_failed_data_id(&self, event_id: Uuid, data_id: &str) -> Result<()>;

    async fn list_failed_data(&self, event_id: Uuid) -> Result<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemHistoryManager {
    events: MemCrud<Event>,
    failed: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl MemHistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn failed(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<String>>> {
        self.failed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HistoryManager for MemHistoryManager {
    async fn create(&self, event: Event) -> Result<Uuid> {
        let id = event.uuid;
        self.events.insert(id, event);
        Ok(id)
    }

    async fn build_history(&self, task_id: Uuid) -> Result<History> {
        let mut events: Vec<Event> = self
            .events
            .list()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.task_id == task_id)
            .collect();
        events.sort_by_key(|e| e.started);
        Ok(History(events))
    }

    async fn purge_history(&self, task_id: Uuid) -> Result<()> {
        let mut purged = Vec::new();
        self.events.retain(|id, e| {
            if e.task_id == task_id {
                purged.push(*id);
                false
            } else {
                true
            }
        });
        let mut failed = self.failed();
        for id in purged {
            failed.remove(&id);
        }
        Ok(())
    }

    async fn store_failed_data_id(&self, event_id: Uuid, data_id: &str) -> Result<()> {
        let mut failed = self.failed();
        let ids = failed.entry(event_id).or_default();
        if !ids.iter().any(|id| id == data_id) {
            ids.push(data_id.to_string());
        }
        Ok(())
    }

    async fn list_failed_data(&self, event_id: Uuid) -> Result<Vec<String>> {
        Ok(self.failed().get(&event_id).cloned().unwrap_or_default())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite backend
// ═══════════════════════════════════════════════════════════════════════

pub struct SqliteHistoryManager {
    pool: SqlitePool,
}

impl SqliteHistoryManager {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::open_history_db(path).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| HarvestError::invalid(format!("corrupt history id '{}': {}", value, e)))
}

#[async_trait]
impl HistoryManager for SqliteHistoryManager {
    async fn create(&self, event: Event) -> Result<Uuid> {
        let r = &event.report;
        sqlx::query(
            r#"
            INSERT INTO history_events
                (id, task_id, started_at, completed_at, acquired, created, updated,
                 failed, failed_to_harvest, failed_to_publish)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.uuid.to_string())
        .bind(event.task_id.to_string())
        .bind(to_millis(event.started))
        .bind(to_millis(event.completed))
        .bind(r.acquired as i64)
        .bind(r.created as i64)
        .bind(r.updated as i64)
        .bind(r.failed as i64)
        .bind(r.failed_to_harvest as i64)
        .bind(r.failed_to_publish as i64)
        .execute(&self.pool)
        .await?;
        Ok(event.uuid)
    }

    async fn build_history(&self, task_id: Uuid) -> Result<History> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, started_at, completed_at, acquired, created, updated,
                   failed, failed_to_harvest, failed_to_publish
            FROM history_events WHERE task_id = ? ORDER BY started_at ASC
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let task: String = row.get("task_id");
            let count = |col: &str| row.get::<i64, _>(col).max(0) as u64;
            events.push(Event {
                uuid: parse_uuid(&id)?,
                task_id: parse_uuid(&task)?,
                started: from_millis(row.get("started_at")),
                completed: from_millis(row.get("completed_at")),
                report: Report {
                    acquired: count("acquired"),
                    created: count("created"),
                    updated: count("updated"),
                    failed: count("failed"),
                    failed_to_harvest: count("failed_to_harvest"),
                    failed_to_publish: count("failed_to_publish"),
                },
            });
        }
        Ok(History(events))
    }

    async fn purge_history(&self, task_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM failed_data WHERE event_id IN (SELECT id FROM history_events WHERE task_id = ?)",
        )
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM history_events WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_failed_data_id(&self, event_id: Uuid, data_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO failed_data (event_id, data_id) VALUES (?, ?)")
            .bind(event_id.to_string())
            .bind(data_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_failed_data(&self, event_id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT data_id FROM failed_data WHERE event_id = ? ORDER BY rowid")
            .bind(event_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("data_id")).collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Recorder
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct RunState {
    started: Option<DateTime<Utc>>,
    report: Report,
    failed_ids: Vec<String>,
}

/// Listener filling a [`Report`] for one run of a stored task and storing
/// it as an [`Event`] when the run completes.
pub struct HistoryRecorder {
    task_id: Uuid,
    manager: Arc<dyn HistoryManager>,
    state: Mutex<RunState>,
}

impl HistoryRecorder {
    pub fn new(task_id: Uuid, manager: Arc<dyn HistoryManager>) -> Self {
        Self {
            task_id,
            manager,
            state: Mutex::new(RunState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn store(&self) -> Result<()> {
        let (event, failed_ids) = {
            let mut state = self.state();
            let completed = Utc::now();
            let event = Event {
                uuid: Uuid::new_v4(),
                task_id: self.task_id,
                started: state.started.unwrap_or(completed),
                completed,
                report: state.report,
            };
            (event, std::mem::take(&mut state.failed_ids))
        };
        let event_id = self.manager.create(event).await?;
        for id in failed_ids {
            self.manager.store_failed_data_id(event_id, &id).await?;
        }
        debug!(task = %self.task_id, event = %event_id, "history event stored");
        Ok(())
    }
}

#[async_trait]
impl ProcessListener for HistoryRecorder {
    async fn on_status_change(&self, process: &ProcessInfo, status: ProcessStatus) {
        match status {
            ProcessStatus::Working => self.state().started = Some(Utc::now()),
            ProcessStatus::Completed => {
                if let Err(e) = self.store().await {
                    error!(process = %process.id, error = %e, "error storing history event");
                }
            }
            _ => {}
        }
    }

    async fn on_data_acquired(&self, _process: &ProcessInfo, _data: &DataReference) {
        self.state().report.acquired += 1;
    }

    async fn on_data_processed(
        &self,
        _process: &ProcessInfo,
        _data: &DataReference,
        status: PublishingStatus,
    ) {
        let mut state = self.state();
        state.report.created += status.created;
        state.report.updated += status.updated;
    }

    async fn on_error(&self, _process: &ProcessInfo, err: &HarvestError) {
        let mut state = self.state();
        state.report.failed += 1;
        match (err.stage(), err.data_id()) {
            (Stage::Output, Some(id)) => {
                state.report.failed_to_publish += 1;
                state.failed_ids.push(id.to_string());
            }
            (Stage::Output, None) => state.report.failed_to_publish += 1,
            _ => state.report.failed_to_harvest += 1,
        }
    }
}
