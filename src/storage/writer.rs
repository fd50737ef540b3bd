//! Background writer that drains alert events into an `EventSink`.
//!
//! The pipeline worker only pushes onto a bounded queue and never blocks: when
//! the queue is full the event is rejected and counted. All sink I/O, retries
//! and backoff happen on the writer thread. Once `finish` is called, queued
//! events get a single attempt each so shutdown is not held up by an outage.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::EventSink;
use crate::alert::AlertEvent;
use crate::error::{ProximityError, ProximityResult};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub struct SinkWriterConfig {
    /// Attempts per event, including the first.
    pub max_attempts: u32,
    /// Base delay; doubles per retry, plus up to 50% jitter.
    pub backoff: Duration,
    /// Events waiting for the writer thread before new ones are rejected.
    pub queue_capacity: usize,
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
            queue_capacity: 256,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: u64,
    pub retried: u64,
    /// Accepted but never persisted.
    pub dropped: u64,
    /// Turned away at submission because the queue was full.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct WriterShared {
    closing: AtomicBool,
    rejected: AtomicU64,
}

/// Cloneable, non-blocking submission handle.
#[derive(Clone, Debug)]
pub struct SinkHandle {
    tx: SyncSender<AlertEvent>,
    shared: Arc<WriterShared>,
    capacity: usize,
}

impl SinkHandle {
    pub fn submit(&self, event: AlertEvent) -> ProximityResult<()> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => {
                self.shared.rejected.fetch_add(1, Ordering::SeqCst);
                ProximityError::SinkWriteFailure(format!(
                    "queue full ({} pending); event for '{}' dropped",
                    self.capacity, event.class_label
                ))
            }
            TrySendError::Disconnected(event) => ProximityError::SinkWriteFailure(format!(
                "writer stopped; event for '{}' not persisted",
                event.class_label
            )),
        })
    }
}

pub struct SinkWriter {
    handle: SinkHandle,
    join: Option<JoinHandle<SinkStats>>,
}

impl SinkWriter {
    pub fn spawn(sink: Box<dyn EventSink>, cfg: SinkWriterConfig) -> Result<Self> {
        if cfg.max_attempts == 0 {
            return Err(anyhow!("sink writer needs at least one attempt per event"));
        }
        if cfg.queue_capacity == 0 {
            return Err(anyhow!("sink writer queue capacity must be at least 1"));
        }
        let (tx, rx) = mpsc::sync_channel(cfg.queue_capacity);
        let shared = Arc::new(WriterShared::default());
        let drain_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("alert-sink".to_string())
            .spawn(move || drain(rx, sink, cfg, &drain_shared))?;
        Ok(Self {
            handle: SinkHandle {
                tx,
                shared,
                capacity: cfg.queue_capacity,
            },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SinkHandle {
        self.handle.clone()
    }

    /// Flush and stop. Remaining events get one attempt each. Every other
    /// `SinkHandle` must be dropped first or this blocks until they are.
    pub fn finish(mut self) -> Result<SinkStats> {
        let shared = self.handle.shared.clone();
        shared.closing.store(true, Ordering::SeqCst);
        drop(self.handle);
        let mut stats = match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("alert sink thread panicked"))?,
            None => SinkStats::default(),
        };
        stats.rejected = shared.rejected.load(Ordering::SeqCst);
        Ok(stats)
    }
}

fn drain(
    rx: Receiver<AlertEvent>,
    mut sink: Box<dyn EventSink>,
    cfg: SinkWriterConfig,
    shared: &WriterShared,
) -> SinkStats {
    let mut stats = SinkStats::default();
    for event in rx {
        let mut attempt = 1;
        loop {
            match sink.append(&event) {
                Ok(()) => {
                    stats.written += 1;
                    break;
                }
                Err(e) if attempt < cfg.max_attempts && !shared.closing.load(Ordering::SeqCst) => {
                    stats.retried += 1;
                    let delay = backoff_delay(cfg.backoff, attempt);
                    log::warn!(
                        "alert store write failed (attempt {}/{}), retrying in {:?}: {:#}",
                        attempt,
                        cfg.max_attempts,
                        delay,
                        e
                    );
                    sleep_unless_closing(delay, shared);
                    attempt += 1;
                }
                Err(e) => {
                    stats.dropped += 1;
                    let err = ProximityError::SinkWriteFailure(format!("{:#}", e));
                    log::error!(
                        "{} (dropping event for '{}' at {:.2} after {} attempts)",
                        err,
                        event.class_label,
                        event.distance,
                        attempt
                    );
                    break;
                }
            }
        }
    }
    log::debug!(
        "alert sink drained: written={} retried={} dropped={}",
        stats.written,
        stats.retried,
        stats.dropped
    );
    stats
}

fn sleep_unless_closing(delay: Duration, shared: &WriterShared) {
    let deadline = Instant::now() + delay;
    while !shared.closing.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(10));
    let jitter_ms = (exp.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryEventStore;
    use chrono::Local;

    fn event(label: &str) -> AlertEvent {
        AlertEvent {
            timestamp: Local::now(),
            class_label: label.to_string(),
            distance: 10.0,
        }
    }

    fn quick() -> SinkWriterConfig {
        SinkWriterConfig {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            ..SinkWriterConfig::default()
        }
    }

    #[test]
    fn retries_transient_failures() -> Result<()> {
        let store = InMemoryEventStore::new();
        store.fail_next(2);
        let writer = SinkWriter::spawn(Box::new(store.clone()), quick())?;
        writer.handle().submit(event("person"))?;
        let stats = writer.finish()?;

        assert_eq!(stats.written, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn drops_event_after_bounded_attempts() -> Result<()> {
        let store = InMemoryEventStore::new();
        store.fail_next(3);
        let writer = SinkWriter::spawn(Box::new(store.clone()), quick())?;
        let handle = writer.handle();
        handle.submit(event("person"))?;
        handle.submit(event("car"))?;
        drop(handle);
        let stats = writer.finish()?;

        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(store.events()[0].class_label, "car");
        Ok(())
    }

    #[test]
    fn full_queue_rejects_without_blocking() -> Result<()> {
        let store = InMemoryEventStore::new();
        store.fail_next(u32::MAX);
        let writer = SinkWriter::spawn(
            Box::new(store.clone()),
            SinkWriterConfig {
                max_attempts: 3,
                backoff: Duration::from_secs(5),
                queue_capacity: 2,
            },
        )?;
        let handle = writer.handle();
        let started = Instant::now();
        let results: Vec<_> = (0..10).map(|_| handle.submit(event("person"))).collect();
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(handle);

        let accepted = results.iter().filter(|r| r.is_ok()).count() as u64;
        assert!(accepted <= 3);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ProximityError::SinkWriteFailure(_))));

        let stats = writer.finish()?;
        assert_eq!(stats.rejected, 10 - accepted);
        assert_eq!(stats.dropped, accepted);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn finish_skips_retries_during_outage() -> Result<()> {
        let store = InMemoryEventStore::new();
        store.fail_next(u32::MAX);
        let writer = SinkWriter::spawn(
            Box::new(store.clone()),
            SinkWriterConfig {
                max_attempts: 5,
                backoff: Duration::from_millis(200),
                queue_capacity: 64,
            },
        )?;
        let handle = writer.handle();
        for _ in 0..40 {
            handle.submit(event("person"))?;
        }
        drop(handle);

        let started = Instant::now();
        let stats = writer.finish()?;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stats.dropped, 40);
        assert_eq!(stats.written, 0);
        Ok(())
    }

    #[test]
    fn backoff_grows_per_attempt() {
        let base = Duration::from_millis(10);
        assert!(backoff_delay(base, 1) < Duration::from_millis(16));
        assert!(backoff_delay(base, 3) >= Duration::from_millis(40));
    }
}
