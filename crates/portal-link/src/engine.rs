//! # Portal Engine
//!
//! The processing role: consumes link events, feeds the inventory store and
//! the direction detector, and drives inventory rounds while a session runs.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Portal Engine                                  │
//! │                                                                         │
//! │  ┌──────────────────────── event task ────────────────────────────┐    │
//! │  │  select! {                                                      │    │
//! │  │    events.next()  ─► TagRead    ─► store.upsert                 │    │
//! │  │                                     └ became_detected ─►        │    │
//! │  │                                       detector.record_detection │    │
//! │  │                      SensorEdge ─► detector.on_edge             │    │
//! │  │                                     └ Completed ─► broadcast    │    │
//! │  │                      Error      ─► warn                         │    │
//! │  │    poll.tick()    ─► detector.poll (expire stale activations)   │    │
//! │  │    shutdown       ─► exit                                       │    │
//! │  │  }                                                              │    │
//! │  │  stream ended ─► store.end_session(LinkFailure)                 │    │
//! │  └────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! │  ┌──────────────────────── round task (per session) ──────────────┐    │
//! │  │  every round_interval: send StartInventory, await round summary │    │
//! │  │  command failure ─► store.end_session(CommandFailure)           │    │
//! │  └────────────────────────────────────────────────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The reader performs one fast-switch round per `StartInventory`, so the
//! round task keeps re-issuing it for as long as the session runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use portal_core::codec::{ReaderFault, TagRead};
use portal_core::direction::{EdgeOutcome, Expiry};
use portal_core::{
    Command, DirectionConfig, DirectionDetector, DirectionEvent, Message, PortalState,
    ReaderConfig, RssiSample, SensorEdge,
};
use portal_store::{InventoryStore, SessionStatus, StopReason, StoreError};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult, LinkError};
use crate::link::{EventStream, LinkHandle, LinkState, LinkStats};
use crate::queue::LinkEvent;
use crate::retry::{send_with_retry, RetryPolicy};

/// Direction events buffered per subscriber before the slowest one lags.
const DIRECTION_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Engine timing and policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub direction: DirectionConfig,
    /// Pause between inventory rounds.
    pub round_interval: Duration,
    /// How often stale portal activations are expired.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            direction: DirectionConfig::default(),
            round_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time engine status for presentation.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub session: SessionStatus,
    pub link: LinkState,
    pub portal: PortalState,
    pub link_stats: LinkStats,
    pub direction_events: u64,
    pub unique_tags: usize,
}

// =============================================================================
// Engine Handle
// =============================================================================

struct RoundLoop {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Handle for controlling the engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    link: LinkHandle,
    store: Arc<InventoryStore>,
    config: EngineConfig,
    rounds: Arc<Mutex<Option<RoundLoop>>>,
    directions: broadcast::Sender<DirectionEvent>,
    portal: watch::Receiver<PortalState>,
    direction_count: Arc<AtomicU64>,
    shutdown_tx: mpsc::Sender<()>,
}

impl EngineHandle {
    /// Configures the reader and starts an inventory session.
    ///
    /// The store enters `Running` only after the reader acknowledged the
    /// first start-inventory command.
    pub async fn start_session(&self, config: ReaderConfig) -> EngineResult<()> {
        config.validate()?;

        let mut rounds = self.rounds.lock().await;
        if self.store.is_running() {
            return Err(StoreError::SessionRunning.into());
        }
        // A round task left over from a failed session has already exited.
        if let Some(previous) = rounds.take() {
            let _ = previous.stop.send(true);
            let _ = previous.task.await;
        }

        for command in config.commands() {
            send_with_retry(&self.link, &command, &self.config.retry).await?;
            debug!(%command, "Reader setting applied");
        }

        let start = Command::StartInventory(config.antennas);
        let ack = send_with_retry(&self.link, &start, &self.config.retry).await?;
        if let Some(round) = ack.round {
            debug!(reads = round.total_reads, duration_ms = round.duration_ms, "First inventory round complete");
        }

        self.store.begin_session(config)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(round_loop(
            self.link.clone(),
            self.store.clone(),
            start,
            self.config,
            stop_rx,
        ));
        *rounds = Some(RoundLoop {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Stops the running session. Inventory data is kept.
    pub async fn stop_session(&self) -> EngineResult<SessionStatus> {
        let mut rounds = self.rounds.lock().await;
        if let Some(running) = rounds.take() {
            let _ = running.stop.send(true);
            let _ = running.task.await;
        }

        if !self.store.is_running() {
            return Err(StoreError::SessionNotRunning {
                phase: self.store.session_status().phase,
            }
            .into());
        }

        if let Err(e) = self.link.send_command(&Command::StopInventory).await {
            warn!(error = %e, "Stop inventory command failed");
        }
        Ok(self.store.end_session(StopReason::Requested)?)
    }

    /// Receives every completed direction event from now on.
    pub fn subscribe_directions(&self) -> broadcast::Receiver<DirectionEvent> {
        self.directions.subscribe()
    }

    pub fn store(&self) -> &Arc<InventoryStore> {
        &self.store
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            session: self.store.session_status(),
            link: self.link.state(),
            portal: *self.portal.borrow(),
            link_stats: self.link.stats(),
            direction_events: self.direction_count.load(Ordering::Relaxed),
            unique_tags: self.store.len(),
        }
    }

    /// Stops the round task and the event task.
    pub async fn shutdown(&self) -> EngineResult<()> {
        if let Some(running) = self.rounds.lock().await.take() {
            let _ = running.stop.send(true);
            let _ = running.task.await;
        }
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| EngineError::ShuttingDown)
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Processing task over one link.
///
/// ## Usage
/// ```rust,ignore
/// let store = Arc::new(InventoryStore::new(StoreConfig::default()));
/// let (link, events) = SerialLink::connect("/dev/ttyUSB0", 115_200, LinkConfig::default())?;
/// let engine = PortalEngine::spawn(link, events, store.clone(), EngineConfig::default());
///
/// let mut passages = engine.subscribe_directions();
/// engine.start_session(ReaderConfig::default()).await?;
///
/// while let Ok(event) = passages.recv().await {
///     println!("{} with {} tags", event.direction, event.tags.len());
/// }
/// ```
pub struct PortalEngine {
    link: LinkHandle,
    events: EventStream,
    store: Arc<InventoryStore>,
    detector: DirectionDetector,
    poll_interval: Duration,
    directions: broadcast::Sender<DirectionEvent>,
    portal: watch::Sender<PortalState>,
    direction_count: Arc<AtomicU64>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl PortalEngine {
    /// Spawns the event task and returns its handle.
    pub fn spawn(
        link: LinkHandle,
        events: EventStream,
        store: Arc<InventoryStore>,
        config: EngineConfig,
    ) -> EngineHandle {
        let (directions, _) = broadcast::channel(DIRECTION_CHANNEL_CAPACITY);
        let (portal_tx, portal_rx) = watch::channel(PortalState::Idle);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let direction_count = Arc::new(AtomicU64::new(0));

        let engine = PortalEngine {
            link: link.clone(),
            events,
            store: store.clone(),
            detector: DirectionDetector::new(config.direction),
            poll_interval: config.poll_interval,
            directions: directions.clone(),
            portal: portal_tx,
            direction_count: direction_count.clone(),
            shutdown_rx,
        };

        tokio::spawn(engine.run());

        EngineHandle {
            link,
            store,
            config,
            rounds: Arc::new(Mutex::new(None)),
            directions,
            portal: portal_rx,
            direction_count,
            shutdown_tx,
        }
    }

    async fn run(mut self) {
        info!("Portal engine started");

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.next() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        self.on_link_lost();
                        break;
                    }
                },

                _ = poll.tick() => {
                    if let Some(expiry) = self.detector.poll(Instant::now()) {
                        log_expiry(&expiry);
                    }
                    self.publish_portal_state();
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Engine shutdown requested");
                    break;
                }
            }
        }

        info!("Portal engine stopped");
    }

    fn handle(&mut self, event: LinkEvent) {
        match event.message {
            Message::TagRead(read) => self.on_tag_read(read, event.received_at),
            Message::SensorEdge(edge) => self.on_sensor_edge(edge, event.received_at),
            Message::Error(fault) => on_reader_fault(&fault),
            Message::CommandAck(ack) => {
                debug!(command = ack.command, status = ack.status, "Command acknowledged");
            }
            Message::InventoryRound(round) => {
                debug!(reads = round.total_reads, duration_ms = round.duration_ms, "Inventory round summary");
            }
        }
    }

    fn on_tag_read(&mut self, read: TagRead, received_at: Instant) {
        let sample = RssiSample::new(read.antenna, read.rssi.dbm(), received_at);
        match self.store.upsert(read.epc.clone(), sample) {
            Ok(outcome) if outcome.became_detected => {
                let attributed = self.detector.record_detection(&read.epc);
                debug!(epc = %read.epc, attributed, "Detected tag");
            }
            Ok(_) => {}
            // Reads arriving between stop and the reader going quiet.
            Err(StoreError::SessionNotRunning { .. }) => {}
            Err(StoreError::PlaceholderTag { epc }) => debug!(%epc, "Ignoring placeholder EPC"),
            Err(e) => warn!(epc = %read.epc, error = %e, "Tag read not recorded"),
        }
    }

    fn on_sensor_edge(&mut self, edge: SensorEdge, received_at: Instant) {
        let result = self.detector.on_edge(edge, received_at);
        if let Some(expiry) = &result.expired {
            log_expiry(expiry);
        }

        match result.outcome {
            EdgeOutcome::Activated(sensor) => debug!(%sensor, "Portal activated"),
            EdgeOutcome::Correlated { gap } => {
                debug!(gap_ms = gap.as_millis() as u64, "Second sensor triggered")
            }
            EdgeOutcome::Cleared(sensor) => debug!(%sensor, "Sensor cleared"),
            EdgeOutcome::Duplicate(sensor) => debug!(%sensor, "Repeated trigger ignored"),
            EdgeOutcome::Ignored => debug!(sensor = %edge.sensor, edge = %edge.edge, "Edge ignored"),
            EdgeOutcome::Completed(passage) => {
                info!(
                    id = %passage.id,
                    direction = %passage.direction,
                    first_sensor = %passage.first_sensor,
                    tags = passage.tags.len(),
                    gap_ms = passage.trigger_gap().as_millis() as u64,
                    "Passage detected"
                );
                self.direction_count.fetch_add(1, Ordering::Relaxed);
                // No subscribers is fine.
                let _ = self.directions.send(passage);
            }
        }
        self.publish_portal_state();
    }

    fn publish_portal_state(&self) {
        let state = self.detector.state();
        self.portal.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn on_link_lost(&mut self) {
        let reason = match self.link.state() {
            LinkState::Disconnected(reason) => reason,
            LinkState::Connected => LinkError::Closed,
        };
        self.detector.reset();
        self.publish_portal_state();

        if self.store.is_running() {
            if let Err(e) = self.store.end_session(StopReason::LinkFailure(reason.to_string())) {
                debug!(error = %e, "Session already ended");
            }
        }
        warn!(%reason, "Link event stream ended");
    }
}

async fn round_loop(
    link: LinkHandle,
    store: Arc<InventoryStore>,
    start: Command,
    config: EngineConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut rounds = 0u64;
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(config.round_interval) => {}
        }

        let result = tokio::select! {
            _ = stop.changed() => break,
            result = send_with_retry(&link, &start, &config.retry) => result,
        };

        match result {
            Ok(ack) => {
                rounds += 1;
                if let Some(round) = ack.round {
                    debug!(round = rounds, reads = round.total_reads, duration_ms = round.duration_ms, "Inventory round complete");
                }
            }
            Err(e) => {
                error!(error = %e, rounds, "Inventory round failed, stopping session");
                let reason = if e.is_link_down() {
                    StopReason::LinkFailure(e.to_string())
                } else {
                    StopReason::CommandFailure(e.to_string())
                };
                if let Err(e) = store.end_session(reason) {
                    debug!(error = %e, "Session already ended");
                }
                break;
            }
        }
    }
    debug!(rounds, "Round loop stopped");
}

fn on_reader_fault(fault: &ReaderFault) {
    warn!(
        command = fault.command,
        antenna = %fault.antenna,
        code = fault.code,
        "Reader reported a fault"
    );
}

fn log_expiry(expiry: &Expiry) {
    warn!(
        reason = ?expiry.reason,
        state = %expiry.state,
        active_ms = expiry.active_for.as_millis() as u64,
        discarded_tags = expiry.discarded_tags,
        "Portal activation expired"
    );
}
