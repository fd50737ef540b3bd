//! Append-only persistence for alert events.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::alert::AlertEvent;

mod writer;

pub use writer::{SinkHandle, SinkStats, SinkWriter, SinkWriterConfig};

/// Durable sink for alert events. Events are never updated or deleted.
pub trait EventSink: Send {
    fn append(&mut self, event: &AlertEvent) -> Result<()>;

    /// The newest `limit` events, returned oldest first.
    fn read_events(&mut self, limit: usize) -> Result<Vec<AlertEvent>>;
}

/// One row of the review listing: events in timestamp order, numbered from 1.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReviewEntry {
    pub no: usize,
    #[serde(flatten)]
    pub event: AlertEvent,
}

pub fn review_entries(mut events: Vec<AlertEvent>) -> Vec<ReviewEntry> {
    events.sort_by_key(|e| e.timestamp);
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| ReviewEntry { no: i + 1, event })
        .collect()
}

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    /// Open (or create) a store. `file:` URIs are opened in URI mode so
    /// shared in-memory databases work across connections.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let mut store = Self { conn };
        store
            .ensure_schema()
            .with_context(|| format!("failed to prepare alert store {}", db_path))?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alert_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              class_label TEXT NOT NULL,
              distance REAL NOT NULL,
              payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alert_events_created ON alert_events(created_at_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM alert_events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// The newest `limit` events, optionally for one class, oldest first.
    pub fn read_recent(&self, limit: usize, class_label: Option<&str>) -> Result<Vec<AlertEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT created_at_ms, class_label, distance FROM alert_events \
             WHERE ?2 IS NULL OR class_label = ?2 \
             ORDER BY created_at_ms DESC, id DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64, class_label])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let created_at_ms: i64 = row.get(0)?;
            let timestamp = Local
                .timestamp_millis_opt(created_at_ms)
                .single()
                .ok_or_else(|| anyhow!("corrupt alert store: timestamp {}", created_at_ms))?;
            out.push(AlertEvent {
                timestamp,
                class_label: row.get(1)?,
                distance: row.get(2)?,
            });
        }
        out.reverse();
        Ok(out)
    }
}

impl EventSink for SqliteEventStore {
    fn append(&mut self, event: &AlertEvent) -> Result<()> {
        let payload_json = serde_json::to_string(event)?;
        self.conn.execute(
            r#"
            INSERT INTO alert_events(created_at_ms, class_label, distance, payload_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.timestamp.timestamp_millis(),
                event.class_label,
                event.distance,
                payload_json
            ],
        )?;
        Ok(())
    }

    fn read_events(&mut self, limit: usize) -> Result<Vec<AlertEvent>> {
        self.read_recent(limit, None)
    }
}

/// Shared in-memory store. Clones see the same events.
///
/// `fail_next(n)` makes the next `n` appends fail, for exercising retry paths.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    events: Arc<Mutex<Vec<AlertEvent>>>,
    failures_remaining: Arc<AtomicU32>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemoryEventStore {
    fn append(&mut self, event: &AlertEvent) -> Result<()> {
        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(anyhow!("injected store failure"));
        }
        self.events
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?
            .push(event.clone());
        Ok(())
    }

    fn read_events(&mut self, limit: usize) -> Result<Vec<AlertEvent>> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))?
            .clone();
        events.sort_by_key(|e| e.timestamp);
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }
}
