//! Proximity alert state machine.
//!
//! Runs once per frame on the pipeline worker:
//!
//! 1. Every detection with a distance overwrites `ObjectState[class]`.
//! 2. The alert condition is evaluated on the current frame only. Stale
//!    object states never keep an alert alive or start a new one.
//! 3. `Idle -> Alerting` yields `Start`, `Alerting -> Idle` yields `Stop`,
//!    self transitions yield nothing.
//! 4. Every detection under the threshold yields one `AlertEvent`, in every
//!    frame, whatever the phase. This is deliberate per-frame logging for
//!    continuous tracking; consecutive frames are not deduplicated.
//!
//! Side effects are not performed here. `AlertEffects` applies a step's
//! transition to the audio device and queues its events for persistence, so a
//! failing device or store can never corrupt the decision itself.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::audio::AlertDevice;
use crate::processor::AnnotatedDetection;
use crate::storage::SinkHandle;

/// Default alert threshold (inches).
pub const DEFAULT_THRESHOLD_DISTANCE: f64 = 25.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPhase {
    Idle,
    Alerting,
}

/// Edge produced by one step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTransition {
    Start,
    Stop,
}

/// Alert flag plus the instant of its last transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertState {
    pub active: bool,
    pub since: Instant,
}

/// Last distance seen for a class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectState {
    pub distance: f64,
    pub updated_at: Instant,
}

/// Immutable record of one detection under the threshold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    #[serde(with = "event_time")]
    pub timestamp: DateTime<Local>,
    #[serde(rename = "name")]
    pub class_label: String,
    pub distance: f64,
}

/// Output of one controller step.
#[derive(Clone, Debug)]
pub struct AlertStep {
    pub transition: Option<AlertTransition>,
    pub events: Vec<AlertEvent>,
    pub state: AlertState,
}

pub struct ProximityAlertController {
    threshold: f64,
    phase: AlertPhase,
    since: Instant,
    objects: HashMap<String, ObjectState>,
    stale_after: Option<Duration>,
}

impl ProximityAlertController {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            phase: AlertPhase::Idle,
            since: Instant::now(),
            objects: HashMap::new(),
            stale_after: None,
        }
    }

    /// Forget classes not observed for `ttl`. Without it entries live forever.
    pub fn with_stale_after(mut self, ttl: Option<Duration>) -> Self {
        self.stale_after = ttl;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn phase(&self) -> AlertPhase {
        self.phase
    }

    pub fn state(&self) -> AlertState {
        AlertState {
            active: self.phase == AlertPhase::Alerting,
            since: self.since,
        }
    }

    pub fn object_state(&self, class_label: &str) -> Option<ObjectState> {
        self.objects.get(class_label).copied()
    }

    /// Copy of the per-class table for read-only consumers.
    pub fn objects(&self) -> HashMap<String, ObjectState> {
        self.objects.clone()
    }

    pub fn step(&mut self, detections: &[AnnotatedDetection]) -> AlertStep {
        self.step_at(detections, Instant::now(), Local::now())
    }

    pub fn step_at(
        &mut self,
        detections: &[AnnotatedDetection],
        now: Instant,
        wall_clock: DateTime<Local>,
    ) -> AlertStep {
        let mut events = Vec::new();
        for det in detections {
            let Some(distance) = det.distance else {
                continue;
            };
            self.objects.insert(
                det.class_label().to_string(),
                ObjectState {
                    distance,
                    updated_at: now,
                },
            );
            if distance < self.threshold {
                events.push(AlertEvent {
                    timestamp: wall_clock,
                    class_label: det.class_label().to_string(),
                    distance,
                });
            }
        }

        if let Some(ttl) = self.stale_after {
            self.objects
                .retain(|_, obj| now.saturating_duration_since(obj.updated_at) <= ttl);
        }

        let any_under_threshold = !events.is_empty();
        let transition = match (self.phase, any_under_threshold) {
            (AlertPhase::Idle, true) => {
                self.phase = AlertPhase::Alerting;
                self.since = now;
                Some(AlertTransition::Start)
            }
            (AlertPhase::Alerting, false) => {
                self.phase = AlertPhase::Idle;
                self.since = now;
                Some(AlertTransition::Stop)
            }
            _ => None,
        };

        AlertStep {
            transition,
            events,
            state: self.state(),
        }
    }
}

/// Counters for side effects that failed without affecting the decision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EffectStats {
    pub starts: u64,
    pub stops: u64,
    pub device_failures: u64,
    pub events_queued: u64,
    pub events_rejected: u64,
}

/// Applies controller steps to the audio device and the event sink queue.
pub struct AlertEffects {
    device: Box<dyn AlertDevice>,
    sink: SinkHandle,
    stats: EffectStats,
}

impl AlertEffects {
    pub fn new(device: Box<dyn AlertDevice>, sink: SinkHandle) -> Self {
        Self {
            device,
            sink,
            stats: EffectStats::default(),
        }
    }

    pub fn stats(&self) -> EffectStats {
        self.stats
    }

    /// Device first, then persistence. Neither can fail the step.
    pub fn apply(&mut self, step: &AlertStep) {
        match step.transition {
            Some(AlertTransition::Start) => {
                self.stats.starts += 1;
                log::warn!(
                    "proximity alert started ({} detections under threshold)",
                    step.events.len()
                );
                if let Err(e) = self.device.start() {
                    self.stats.device_failures += 1;
                    log::error!("alert device failed to start: {:#}", e);
                }
            }
            Some(AlertTransition::Stop) => {
                self.stats.stops += 1;
                log::info!("proximity alert cleared");
                if let Err(e) = self.device.stop() {
                    self.stats.device_failures += 1;
                    log::error!("alert device failed to stop: {:#}", e);
                }
            }
            None => {}
        }

        for event in &step.events {
            match self.sink.submit(event.clone()) {
                Ok(()) => self.stats.events_queued += 1,
                Err(e) => {
                    self.stats.events_rejected += 1;
                    log::error!("{}", e);
                }
            }
        }
    }

    /// Silence the device on shutdown.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.device.stop() {
            log::warn!("alert device failed to stop on shutdown: {:#}", e);
        }
    }
}

mod event_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(ts: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(d)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(de::Error::custom)?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| de::Error::custom(format!("nonexistent local time {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::processor::Anchor;
    use chrono::TimeZone;

    fn at(label: &str, distance: Option<f64>) -> AnnotatedDetection {
        AnnotatedDetection {
            detection: Detection::new(label, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            distance,
            anchor: Anchor { x: 0.0, y: 0.0 },
        }
    }

    #[test]
    fn person_approach_and_retreat_yields_one_start_one_stop_one_event() {
        let mut ctl = ProximityAlertController::new(25.0);
        let mut transitions = Vec::new();
        let mut events = 0;
        for d in [40.0, 30.0, 20.0, 30.0, 40.0] {
            let step = ctl.step(&[at("person", Some(d))]);
            transitions.push(step.transition);
            events += step.events.len();
        }
        assert_eq!(
            transitions,
            vec![
                None,
                None,
                Some(AlertTransition::Start),
                Some(AlertTransition::Stop),
                None
            ]
        );
        assert_eq!(events, 1);
        assert_eq!(ctl.phase(), AlertPhase::Idle);
    }

    #[test]
    fn full_sink_queue_still_starts_the_device() -> anyhow::Result<()> {
        use crate::audio::LogAlarm;
        use crate::storage::{InMemoryEventStore, SinkWriter, SinkWriterConfig};

        let store = InMemoryEventStore::new();
        store.fail_next(u32::MAX);
        let writer = SinkWriter::spawn(
            Box::new(store.clone()),
            SinkWriterConfig {
                max_attempts: 2,
                backoff: Duration::from_secs(5),
                queue_capacity: 1,
            },
        )?;
        let mut effects = AlertEffects::new(Box::new(LogAlarm::new()), writer.handle());
        let mut ctl = ProximityAlertController::new(25.0);
        let frame: Vec<_> = (0..6).map(|_| at("person", Some(10.0))).collect();

        let step = ctl.step(&frame);
        effects.apply(&step);
        assert!(step.state.active);
        let stats = effects.stats();
        assert_eq!(stats.starts, 1);
        assert_eq!(stats.device_failures, 0);
        assert!(stats.events_rejected >= 4);
        assert_eq!(stats.events_queued + stats.events_rejected, 6);

        drop(effects);
        let sink = writer.finish()?;
        assert_eq!(sink.rejected, stats.events_rejected);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn repeating_a_frame_while_alerting_does_not_restart() {
        let mut ctl = ProximityAlertController::new(25.0);
        let frame = [at("person", Some(10.0))];
        assert_eq!(ctl.step(&frame).transition, Some(AlertTransition::Start));
        let again = ctl.step(&frame);
        assert_eq!(again.transition, None);
        // per-frame logging continues while the condition holds
        assert_eq!(again.events.len(), 1);
        assert!(again.state.active);
    }

    #[test]
    fn stale_state_does_not_keep_alert_active() {
        let mut ctl = ProximityAlertController::new(25.0);
        ctl.step(&[at("person", Some(10.0))]);
        let step = ctl.step(&[at("car", Some(90.0))]);
        assert_eq!(step.transition, Some(AlertTransition::Stop));
        // the person entry is still remembered
        assert_eq!(ctl.object_state("person").map(|o| o.distance), Some(10.0));
    }

    #[test]
    fn detections_without_distance_never_alert_or_update_state() {
        let mut ctl = ProximityAlertController::new(25.0);
        let step = ctl.step(&[at("person", None)]);
        assert!(step.transition.is_none());
        assert!(ctl.object_state("person").is_none());
    }

    #[test]
    fn one_event_per_qualifying_detection() {
        let mut ctl = ProximityAlertController::new(25.0);
        let step = ctl.step(&[
            at("person", Some(12.0)),
            at("person", Some(20.0)),
            at("bicycle", Some(26.0)),
        ]);
        assert_eq!(step.events.len(), 2);
        assert_eq!(ctl.object_state("person").map(|o| o.distance), Some(20.0));
    }

    #[test]
    fn threshold_is_strict() {
        let mut ctl = ProximityAlertController::new(25.0);
        assert!(ctl.step(&[at("person", Some(25.0))]).transition.is_none());
    }

    #[test]
    fn stale_entries_expire_with_ttl() {
        let start = Instant::now();
        let mut ctl =
            ProximityAlertController::new(25.0).with_stale_after(Some(Duration::from_secs(5)));
        ctl.step_at(&[at("person", Some(50.0))], start, Local::now());
        ctl.step_at(
            &[at("car", Some(80.0))],
            start + Duration::from_secs(10),
            Local::now(),
        );
        assert!(ctl.object_state("person").is_none());
        assert!(ctl.object_state("car").is_some());
    }

    #[test]
    fn event_serializes_in_review_shape() {
        let ts = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).single().unwrap();
        let event = AlertEvent {
            timestamp: ts,
            class_label: "person".into(),
            distance: 12.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp"], "2024-03-05 14:07:09");
        assert_eq!(json["name"], "person");
        let back: AlertEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
