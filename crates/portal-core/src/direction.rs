//! # Direction Detector
//!
//! Correlates the two portal sensors into IN/OUT passage events.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │                        ┌────────┐                                       │
//! │        S1 ↑  ┌──────── │  Idle  │ ────────┐  S2 ↑                       │
//! │              │         └────────┘         │                             │
//! │              ▼            ▲    ▲          ▼                             │
//! │     ┌───────────────┐     │    │   ┌───────────────┐                    │
//! │     │ Sensor1Active │     │    │   │ Sensor2Active │                    │
//! │     └───────┬───────┘  window  │   └───────┬───────┘                    │
//! │             │          expired │           │                            │
//! │        S2 ↑ │ (within window)  │      S1 ↑ │                            │
//! │             ▼                  │           ▼                            │
//! │          ┌──────────────────────────────────────┐                       │
//! │          │              BothActive              │                       │
//! │          └──────────────────┬───────────────────┘                       │
//! │                             │ both sensors ↓                            │
//! │                             ▼                                           │
//! │           emit DirectionEvent, back to Idle                             │
//! │           first sensor == inbound sensor → IN, else OUT                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flicker
//! A sensor that rises again after it cleared (a bouncing beam, or a second
//! body part) is a `Duplicate`: trigger times stay as they were. The sensor
//! counts as blocked again, though, so the passage completes only after its
//! next falling edge.
//!
//! Tags whose detection flag turns true between leaving `Idle` and the
//! completing edge are attributed to the event. Time is injected: the
//! detector never reads the clock, so `poll` must be called periodically to
//! expire activations that receive no further edges.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::types::{Direction, Edge, SensorEdge, SensorId, TagIdentity};

// =============================================================================
// Configuration
// =============================================================================

/// Detector timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionConfig {
    /// Longest gap between the first and second sensor triggering.
    pub correlation_window: Duration,
    /// Longest time an activation may stay open after the first trigger
    /// before it is abandoned (stuck sensor).
    pub max_active: Duration,
    /// Sensor whose earlier trigger means the object is coming in.
    pub inbound_sensor: SensorId,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        DirectionConfig {
            correlation_window: Duration::from_secs(3),
            max_active: Duration::from_secs(10),
            inbound_sensor: SensorId::One,
        }
    }
}

// =============================================================================
// States, Outcomes & Events
// =============================================================================

/// Observable detector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Idle,
    Sensor1Active,
    Sensor2Active,
    BothActive,
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalState::Idle => write!(f, "idle"),
            PortalState::Sensor1Active => write!(f, "sensor1_active"),
            PortalState::Sensor2Active => write!(f, "sensor2_active"),
            PortalState::BothActive => write!(f, "both_active"),
        }
    }
}

/// A completed passage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectionEvent {
    pub id: Uuid,
    pub direction: Direction,
    pub first_sensor: SensorId,
    pub first_triggered_at: Instant,
    pub second_triggered_at: Instant,
    pub completed_at: Instant,
    /// Tags detected while the portal was active, in EPC order.
    pub tags: Vec<TagIdentity>,
}

impl DirectionEvent {
    /// Time between the two sensors triggering.
    pub fn trigger_gap(&self) -> Duration {
        self.second_triggered_at
            .saturating_duration_since(self.first_triggered_at)
    }

    /// Time from the first trigger to the completing edge.
    pub fn passage_time(&self) -> Duration {
        self.completed_at
            .saturating_duration_since(self.first_triggered_at)
    }
}

/// Why an activation was abandoned without an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    /// The other sensor never triggered within the correlation window.
    NoCorrelation,
    /// Both sensors triggered but never both cleared.
    StuckActive,
}

/// An abandoned activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub reason: ExpiryReason,
    pub state: PortalState,
    pub active_for: Duration,
    /// Attributed tags that were discarded.
    pub discarded_tags: usize,
}

/// What an edge did to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// Left `Idle`.
    Activated(SensorId),
    /// The second sensor triggered inside the window.
    Correlated { gap: Duration },
    /// A triggered sensor went low; passage not complete yet.
    Cleared(SensorId),
    /// Passage complete.
    Completed(DirectionEvent),
    /// Rising edge for a sensor that already triggered. Trigger times are
    /// unchanged; a cleared sensor is blocked again.
    Duplicate(SensorId),
    /// Edge with no meaning in the current state.
    Ignored,
}

/// Result of [`DirectionDetector::on_edge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeResult {
    /// Activation expired by the edge's timestamp before it was applied.
    pub expired: Option<Expiry>,
    pub outcome: EdgeOutcome,
}

// =============================================================================
// Detector
// =============================================================================

#[derive(Debug, Clone)]
struct Activation {
    first: SensorId,
    first_at: Instant,
    second_at: Option<Instant>,
    cleared: [bool; 2],
    tags: BTreeSet<TagIdentity>,
}

impl Activation {
    fn new(first: SensorId, at: Instant) -> Self {
        Activation {
            first,
            first_at: at,
            second_at: None,
            cleared: [false; 2],
            tags: BTreeSet::new(),
        }
    }

    fn has_triggered(&self, sensor: SensorId) -> bool {
        sensor == self.first || self.second_at.is_some()
    }

    fn is_complete(&self) -> bool {
        self.second_at.is_some() && self.cleared.iter().all(|c| *c)
    }

    fn state(&self) -> PortalState {
        match (self.second_at, self.first) {
            (Some(_), _) => PortalState::BothActive,
            (None, SensorId::One) => PortalState::Sensor1Active,
            (None, SensorId::Two) => PortalState::Sensor2Active,
        }
    }
}

/// Dual-sensor direction state machine. Owned by a single processing task.
#[derive(Debug, Clone)]
pub struct DirectionDetector {
    config: DirectionConfig,
    activation: Option<Activation>,
}

impl DirectionDetector {
    pub fn new(config: DirectionConfig) -> Self {
        DirectionDetector {
            config,
            activation: None,
        }
    }

    pub fn config(&self) -> &DirectionConfig {
        &self.config
    }

    pub fn state(&self) -> PortalState {
        self.activation
            .as_ref()
            .map_or(PortalState::Idle, Activation::state)
    }

    /// When the current activation left `Idle`.
    pub fn active_since(&self) -> Option<Instant> {
        self.activation.as_ref().map(|a| a.first_at)
    }

    /// Tags attributed to the current activation so far.
    pub fn attributed_tags(&self) -> impl Iterator<Item = &TagIdentity> {
        self.activation.iter().flat_map(|a| a.tags.iter())
    }

    /// Drops any activation without emitting an event.
    pub fn reset(&mut self) {
        self.activation = None;
    }

    /// Applies a sensor edge observed at `at`.
    pub fn on_edge(&mut self, edge: SensorEdge, at: Instant) -> EdgeResult {
        let expired = self.poll(at);
        let outcome = match edge.edge {
            Edge::Rising => self.on_rising(edge.sensor, at),
            Edge::Falling => self.on_falling(edge.sensor, at),
        };
        EdgeResult { expired, outcome }
    }

    /// Expires the activation if its window (or stuck limit) passed by `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Expiry> {
        let active = self.activation.as_ref()?;
        let active_for = now.saturating_duration_since(active.first_at);

        let reason = match active.second_at {
            None if active_for > self.config.correlation_window => ExpiryReason::NoCorrelation,
            Some(_) if active_for > self.config.max_active => ExpiryReason::StuckActive,
            _ => return None,
        };

        let expiry = Expiry {
            reason,
            state: active.state(),
            active_for,
            discarded_tags: active.tags.len(),
        };
        self.activation = None;
        Some(expiry)
    }

    /// Attributes a newly detected tag to the current activation.
    ///
    /// Returns false (and records nothing) while `Idle`.
    pub fn record_detection(&mut self, tag: &TagIdentity) -> bool {
        match self.activation.as_mut() {
            Some(active) => {
                active.tags.insert(tag.clone());
                true
            }
            None => false,
        }
    }

    fn on_rising(&mut self, sensor: SensorId, at: Instant) -> EdgeOutcome {
        let Some(active) = self.activation.as_mut() else {
            self.activation = Some(Activation::new(sensor, at));
            return EdgeOutcome::Activated(sensor);
        };

        if active.has_triggered(sensor) {
            active.cleared[sensor.index()] = false;
            return EdgeOutcome::Duplicate(sensor);
        }
        active.second_at = Some(at);
        EdgeOutcome::Correlated {
            gap: at.saturating_duration_since(active.first_at),
        }
    }

    fn on_falling(&mut self, sensor: SensorId, at: Instant) -> EdgeOutcome {
        let Some(active) = self.activation.as_mut() else {
            return EdgeOutcome::Ignored;
        };
        if !active.has_triggered(sensor) || active.cleared[sensor.index()] {
            return EdgeOutcome::Ignored;
        }

        active.cleared[sensor.index()] = true;
        if !active.is_complete() {
            return EdgeOutcome::Cleared(sensor);
        }

        match self.activation.take() {
            Some(done) => EdgeOutcome::Completed(self.finish(done, at)),
            None => EdgeOutcome::Ignored,
        }
    }

    fn finish(&self, done: Activation, at: Instant) -> DirectionEvent {
        let direction = if done.first == self.config.inbound_sensor {
            Direction::In
        } else {
            Direction::Out
        };
        DirectionEvent {
            id: Uuid::new_v4(),
            direction,
            first_sensor: done.first,
            first_triggered_at: done.first_at,
            second_triggered_at: done.second_at.unwrap_or(done.first_at),
            completed_at: at,
            tags: done.tags.into_iter().collect(),
        }
    }
}

impl Default for DirectionDetector {
    fn default() -> Self {
        DirectionDetector::new(DirectionConfig::default())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
