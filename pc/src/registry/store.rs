//! SQLite-backed process store

use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::domain::{ProcessHandle, ProcessId, ProcessState, now_ms};

/// Database file name inside the data directory
pub const REGISTRY_DB: &str = "registry.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    state          TEXT    NOT NULL,
    paused         INTEGER NOT NULL DEFAULT 0,
    label          TEXT,
    status_message TEXT,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_processes_state ON processes(state);
";

/// Filter for listing processes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessFilter {
    /// Only processes in one of these states (None = any)
    pub states: Option<Vec<ProcessState>>,
    /// Only processes with this paused flag (None = any)
    pub paused: Option<bool>,
}

impl ProcessFilter {
    /// Non-terminal processes, optionally filtered on paused
    pub fn active(paused: Option<bool>) -> Self {
        Self {
            states: Some(ProcessState::active().to_vec()),
            paused,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }
}

/// Durable process registry
pub struct ProcessStore {
    conn: Connection,
}

impl ProcessStore {
    /// Open (or create) the store in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "ProcessStore::open: called");
        std::fs::create_dir_all(dir).context("Failed to create registry directory")?;

        let conn = Connection::open(dir.join(REGISTRY_DB)).context("Failed to open registry database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set registry busy timeout")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize registry schema")?;

        info!(dir = %dir.display(), "Opened process registry");
        Ok(Self { conn })
    }

    /// Create a process with a store-assigned id
    pub fn create(&mut self, label: Option<String>) -> Result<ProcessHandle> {
        debug!(?label, "ProcessStore::create: called");
        let now = now_ms();
        self.conn
            .execute(
                "INSERT INTO processes (state, paused, label, status_message, created_at, updated_at)
                 VALUES (?1, 0, ?2, NULL, ?3, ?3)",
                params![ProcessState::Created.as_str(), label, now],
            )
            .context("Failed to insert process")?;

        let id = ProcessId(self.conn.last_insert_rowid() as u64);
        debug!(%id, "ProcessStore::create: inserted");
        let mut process = ProcessHandle::new(id);
        process.label = label;
        process.created_at = now;
        process.updated_at = now;
        Ok(process)
    }

    /// Insert a process with an explicit id
    pub fn insert(&mut self, process: &ProcessHandle) -> Result<()> {
        debug!(id = %process.id, "ProcessStore::insert: called");
        self.conn
            .execute(
                "INSERT INTO processes (id, state, paused, label, status_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    process.id.as_u64() as i64,
                    process.state.as_str(),
                    process.paused,
                    process.label,
                    process.status_message,
                    process.created_at,
                    process.updated_at,
                ],
            )
            .context(format!("Failed to insert process {}", process.id))?;
        Ok(())
    }

    /// Get a process by id
    pub fn get(&self, id: ProcessId) -> Result<Option<ProcessHandle>> {
        debug!(%id, "ProcessStore::get: called");
        let process = self
            .conn
            .query_row(
                "SELECT id, state, paused, label, status_message, created_at, updated_at
                 FROM processes WHERE id = ?1",
                params![id.as_u64() as i64],
                row_to_process,
            )
            .optional()
            .context("Failed to query process")?;
        Ok(process)
    }

    /// Overwrite an existing process
    ///
    /// Returns false when no process with that id exists.
    pub fn update(&mut self, process: &ProcessHandle) -> Result<bool> {
        debug!(id = %process.id, state = %process.state, paused = process.paused, "ProcessStore::update: called");
        let changed = self
            .conn
            .execute(
                "UPDATE processes
                 SET state = ?2, paused = ?3, label = ?4, status_message = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    process.id.as_u64() as i64,
                    process.state.as_str(),
                    process.paused,
                    process.label,
                    process.status_message,
                    process.updated_at,
                ],
            )
            .context("Failed to update process")?;
        Ok(changed > 0)
    }

    /// List processes matching a filter, ordered by id
    pub fn list(&self, filter: &ProcessFilter) -> Result<Vec<ProcessHandle>> {
        debug!(?filter, "ProcessStore::list: called");
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, state, paused, label, status_message, created_at, updated_at
                 FROM processes ORDER BY id",
            )
            .context("Failed to prepare process listing")?;

        let rows = stmt
            .query_map([], row_to_process)
            .context("Failed to list processes")?;

        let mut processes = Vec::new();
        for row in rows {
            let process = row.context("Failed to read process row")?;
            if let Some(states) = &filter.states
                && !states.contains(&process.state)
            {
                continue;
            }
            if let Some(paused) = filter.paused
                && process.paused != paused
            {
                continue;
            }
            processes.push(process);
        }
        debug!(count = processes.len(), "ProcessStore::list: returning");
        Ok(processes)
    }
}

fn row_to_process(row: &Row<'_>) -> rusqlite::Result<ProcessHandle> {
    let id: i64 = row.get(0)?;
    let state: String = row.get(1)?;
    let state = state.parse::<ProcessState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(ProcessHandle {
        id: ProcessId(id as u64),
        state,
        paused: row.get(2)?,
        label: row.get(3)?,
        status_message: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
