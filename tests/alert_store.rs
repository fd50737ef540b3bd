use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local};
use std::time::Duration;
use tempfile::tempdir;

use proximity_kernel::storage::review_entries;
use proximity_kernel::{AlertEvent, EventSink, SinkWriter, SinkWriterConfig, SqliteEventStore};

fn event(offset_secs: i64, label: &str, distance: f64) -> AlertEvent {
    AlertEvent {
        timestamp: Local::now() - ChronoDuration::seconds(offset_secs),
        class_label: label.to_string(),
        distance,
    }
}

#[test]
fn writer_persists_to_sqlite_and_store_reopens() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("alerts.db");
    let db_path = db_path.to_str().expect("utf-8 path");

    let writer = SinkWriter::spawn(
        Box::new(SqliteEventStore::open(db_path)?),
        SinkWriterConfig {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
            ..SinkWriterConfig::default()
        },
    )?;
    let handle = writer.handle();
    handle.submit(event(5, "person", 14.0))?;
    handle.submit(event(60, "car", 22.5))?;
    handle.submit(event(30, "bicycle", 9.75))?;
    drop(handle);
    let stats = writer.finish()?;
    assert_eq!(stats.written, 3);
    assert_eq!(stats.dropped, 0);

    let mut store = SqliteEventStore::open(db_path)?;
    assert_eq!(store.count()?, 3);
    let entries = review_entries(store.read_events(100)?);
    let labels: Vec<_> = entries.iter().map(|e| e.event.class_label.as_str()).collect();
    assert_eq!(labels, vec!["car", "bicycle", "person"]);
    assert_eq!(entries[2].no, 3);
    Ok(())
}

#[test]
fn file_uri_store_shares_one_database() -> Result<()> {
    let dir = tempdir()?;
    let uri = format!("file:{}", dir.path().join("alerts.db").display());

    let mut writer_side = SqliteEventStore::open(&uri)?;
    let mut reader_side = SqliteEventStore::open(&uri)?;
    writer_side.append(&event(2, "person", 11.0))?;
    writer_side.append(&event(1, "dog", 7.5))?;

    let events = reader_side.read_events(1)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].class_label, "dog");
    assert_eq!(reader_side.count()?, 2);
    Ok(())
}
