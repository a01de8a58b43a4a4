//! Durable launch queue backed by SQLite
//!
//! The queue outlives any single daemon: tasks stay in the table until they
//! are acknowledged, and a crashed consumer's tasks are released on the next
//! start.

use std::path::Path;
use std::time::Duration;

use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::domain::{DeliveryTag, now_ms};

use super::messages::QueuedTask;

/// Database file name inside the data directory
pub const QUEUE_DB: &str = "queue.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS launch_tasks (
    tag          INTEGER PRIMARY KEY AUTOINCREMENT,
    body         TEXT    NOT NULL,
    consumer     TEXT,
    published_at INTEGER NOT NULL
);
";

/// Durable launch queue
pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    /// Open (or create) the queue in the given directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "QueueStore::open: called");
        std::fs::create_dir_all(dir).context("Failed to create queue directory")?;

        let conn = Connection::open(dir.join(QUEUE_DB)).context("Failed to open queue database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set queue busy timeout")?;
        conn.execute_batch(SCHEMA).context("Failed to initialize queue schema")?;

        info!(dir = %dir.display(), "Opened launch queue");
        Ok(Self { conn })
    }

    /// Append a task, returning its delivery tag
    pub fn publish(&mut self, body: &str) -> Result<DeliveryTag> {
        debug!(%body, "QueueStore::publish: called");
        self.conn
            .execute(
                "INSERT INTO launch_tasks (body, consumer, published_at) VALUES (?1, NULL, ?2)",
                params![body, now_ms()],
            )
            .context("Failed to publish task")?;
        let tag = DeliveryTag(self.conn.last_insert_rowid());
        debug!(%tag, "QueueStore::publish: stored");
        Ok(tag)
    }

    /// Every unacknowledged task in publish order
    pub fn list(&self) -> Result<Vec<QueuedTask>> {
        debug!("QueueStore::list: called");
        let mut stmt = self
            .conn
            .prepare("SELECT tag, body, consumer FROM launch_tasks ORDER BY tag")
            .context("Failed to prepare task listing")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(QueuedTask {
                    tag: DeliveryTag(row.get(0)?),
                    body: row.get(1)?,
                    consumer: row.get(2)?,
                })
            })
            .context("Failed to list tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }
        Ok(tasks)
    }

    /// Remove a task; returns false if it was already gone
    pub fn ack(&mut self, tag: DeliveryTag) -> Result<bool> {
        debug!(%tag, "QueueStore::ack: called");
        let removed = self
            .conn
            .execute("DELETE FROM launch_tasks WHERE tag = ?1", params![tag.0])
            .context("Failed to acknowledge task")?;
        Ok(removed > 0)
    }

    /// Atomically hand the oldest ready task to a consumer
    pub fn claim(&mut self, consumer: &str) -> Result<Option<QueuedTask>> {
        debug!(%consumer, "QueueStore::claim: called");
        let task = self
            .conn
            .query_row(
                "UPDATE launch_tasks SET consumer = ?1
                 WHERE tag = (SELECT tag FROM launch_tasks WHERE consumer IS NULL ORDER BY tag LIMIT 1)
                 RETURNING tag, body",
                params![consumer],
                |row| {
                    Ok(QueuedTask {
                        tag: DeliveryTag(row.get(0)?),
                        body: row.get(1)?,
                        consumer: Some(consumer.to_string()),
                    })
                },
            )
            .optional()
            .context("Failed to claim task")?;
        Ok(task)
    }

    /// Return a consumer's tasks to the ready state
    pub fn release(&mut self, consumer: &str) -> Result<usize> {
        debug!(%consumer, "QueueStore::release: called");
        let released = self
            .conn
            .execute(
                "UPDATE launch_tasks SET consumer = NULL WHERE consumer = ?1",
                params![consumer],
            )
            .context("Failed to release tasks")?;
        Ok(released)
    }

    /// Return one held task to the ready state; false if it was not held
    pub fn release_task(&mut self, tag: DeliveryTag) -> Result<bool> {
        debug!(%tag, "QueueStore::release_task: called");
        let released = self
            .conn
            .execute(
                "UPDATE launch_tasks SET consumer = NULL WHERE tag = ?1 AND consumer IS NOT NULL",
                params![tag.0],
            )
            .context("Failed to release task")?;
        Ok(released > 0)
    }

    /// Return every held task to the ready state
    pub fn release_all(&mut self) -> Result<usize> {
        debug!("QueueStore::release_all: called");
        let released = self
            .conn
            .execute("UPDATE launch_tasks SET consumer = NULL WHERE consumer IS NOT NULL", [])
            .context("Failed to release held tasks")?;
        if released > 0 {
            info!(released, "Released tasks held by a previous consumer");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_publish_and_list_in_order() {
        let temp = tempdir().unwrap();
        let mut store = QueueStore::open(temp.path()).unwrap();

        let a = store.publish("a").unwrap();
        let b = store.publish("b").unwrap();
        assert!(b > a);

        let tasks = store.list().unwrap();
        let bodies: Vec<&str> = tasks.iter().map(|t| t.body.as_str()).collect();
        assert_eq!(bodies, vec!["a", "b"]);
        assert!(tasks.iter().all(|t| t.consumer.is_none()));
    }

    #[test]
    fn test_ack_is_idempotent() {
        let temp = tempdir().unwrap();
        let mut store = QueueStore::open(temp.path()).unwrap();

        let tag = store.publish("x").unwrap();
        assert!(store.ack(tag).unwrap());
        assert!(!store.ack(tag).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_claim_skips_held_tasks() {
        let temp = tempdir().unwrap();
        let mut store = QueueStore::open(temp.path()).unwrap();

        let first = store.publish("first").unwrap();
        let second = store.publish("second").unwrap();

        let claimed = store.claim("worker-a").unwrap().unwrap();
        assert_eq!(claimed.tag, first);
        let claimed = store.claim("worker-b").unwrap().unwrap();
        assert_eq!(claimed.tag, second);
        assert!(store.claim("worker-a").unwrap().is_none());

        // Held tasks are still listed: they are not acknowledged yet
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_release_returns_tasks_to_ready() {
        let temp = tempdir().unwrap();
        let mut store = QueueStore::open(temp.path()).unwrap();

        store.publish("a").unwrap();
        store.publish("b").unwrap();
        store.claim("worker-a").unwrap();
        store.claim("worker-b").unwrap();

        assert_eq!(store.release("worker-a").unwrap(), 1);
        assert_eq!(store.release_all().unwrap(), 1);
        assert!(store.list().unwrap().iter().all(|t| t.consumer.is_none()));
    }

    #[test]
    fn test_release_task_only_touches_that_tag() {
        let temp = tempdir().unwrap();
        let mut store = QueueStore::open(temp.path()).unwrap();

        let first = store.publish("a").unwrap();
        let second = store.publish("b").unwrap();
        store.claim("worker-a").unwrap();
        store.claim("worker-a").unwrap();

        assert!(store.release_task(first).unwrap());
        assert!(!store.release_task(first).unwrap());

        let tasks = store.list().unwrap();
        let consumer_of = |tag: DeliveryTag| tasks.iter().find(|t| t.tag == tag).and_then(|t| t.consumer.clone());
        assert_eq!(consumer_of(first), None);
        assert_eq!(consumer_of(second).as_deref(), Some("worker-a"));

        // The released task is the next one handed out
        assert_eq!(store.claim("worker-b").unwrap().unwrap().tag, first);
    }
}
