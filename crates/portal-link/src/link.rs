//! # Serial Link
//!
//! Owns the reader connection: a dedicated I/O thread reads and decodes the
//! byte stream while commands are issued concurrently from async code.
//!
//! ## Roles
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  async callers                         I/O thread (blocking)            │
//! │  ─────────────                         ─────────────────────            │
//! │                                                                         │
//! │  LinkHandle::send_command ─ frame ──► outgoing ──► port.write_all       │
//! │        │ (one in flight)                                                │
//! │        │                               port.read (read_timeout)         │
//! │        │                                    │                           │
//! │        │                                    ▼                           │
//! │        │                              FrameCodec::decode loop           │
//! │        │                                    │                           │
//! │        │            ┌── reply_to matches ───┤                           │
//! │        ◄── oneshot ─┘                       ▼                           │
//! │                                       EventQueue (bounded)              │
//! │  EventStream::next ◄──────────────────────  │                           │
//! │                                                                         │
//! │  CTS/DSR changes (optional) ──► synthesized SensorEdge ──► EventQueue   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resync
//! A decode failure advances past the bytes the codec consumed (one byte for
//! framing errors) and decoding resumes. `max_decode_failures` consecutive
//! failures mean the stream is not framed the way the codec expects; the link
//! then closes with [`LinkError::Desynchronized`].
//!
//! There is no automatic reconnection. A closed link reports
//! `Disconnected(reason)`; the host decides whether to connect again.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::Stream;
use portal_core::codec::InventoryRound;
use portal_core::{
    Command, Decoded, Edge, FrameCodec, FrameFormat, Message, SensorEdge, SensorId,
    BROADCAST_ADDRESS, STATUS_SUCCESS,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{CommandError, ConnectError, LinkError};
use crate::port::{self, ReaderPort};
use crate::queue::{EventQueue, LinkEvent};

/// Pause after a zero-length read so a port that never blocks does not spin.
const IDLE_PAUSE: Duration = Duration::from_millis(1);

const READ_CHUNK: usize = 512;

// =============================================================================
// Configuration
// =============================================================================

/// Link parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub frame_format: FrameFormat,
    /// Reader address put on outbound frames.
    pub reader_address: u8,
    /// Port read timeout; bounds how quickly the I/O thread notices writes,
    /// sensor line changes and `close()`.
    pub read_timeout: Duration,
    pub command_timeout: Duration,
    pub event_queue_capacity: usize,
    pub max_decode_failures: u32,
    /// Synthesize sensor edges from the CTS (sensor 1) and DSR (sensor 2)
    /// modem lines.
    pub modem_line_sensors: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            frame_format: FrameFormat::default(),
            reader_address: BROADCAST_ADDRESS,
            read_timeout: Duration::from_millis(20),
            command_timeout: Duration::from_secs(2),
            event_queue_capacity: 1024,
            max_decode_failures: 64,
            modem_line_sensors: false,
        }
    }
}

// =============================================================================
// Link State & Replies
// =============================================================================

/// Connection state reported by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected(LinkError),
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
        }
    }
}

/// Successful reply to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub command: u8,
    pub status: u8,
    /// Set when the reply was the summary closing an inventory round.
    pub round: Option<InventoryRound>,
}

/// Link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub frames_decoded: u64,
    pub decode_failures: u64,
    pub bytes_discarded: u64,
    pub dropped_events: u64,
    pub queued_events: usize,
}

// =============================================================================
// Shared State
// =============================================================================

struct Pending {
    command: u8,
    reply: oneshot::Sender<Result<Ack, CommandError>>,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
}

struct Shared {
    queue: EventQueue,
    pending: Mutex<Option<Pending>>,
    counters: Counters,
    shutdown: AtomicBool,
    state: watch::Sender<LinkState>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Option<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }
}

// =============================================================================
// Event Injector
// =============================================================================

/// Feeds events read from a second port into a link's queue.
///
/// Holds the link weakly: the link shuts down when its own users are gone,
/// whether or not an injector is still around.
#[derive(Clone)]
pub(crate) struct EventInjector {
    shared: Weak<Shared>,
}

impl EventInjector {
    /// Queues `message`. Returns false once the link is down.
    pub(crate) fn push(&self, message: Message) -> bool {
        match self.shared.upgrade() {
            Some(shared) if shared.is_connected() => {
                shared.queue.push(LinkEvent::new(message, Instant::now()));
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.shared
            .upgrade()
            .map_or(false, |shared| shared.is_connected())
    }
}

// =============================================================================
// Link Handle
// =============================================================================

/// Handle for issuing commands and observing the link. Cheap to clone.
#[derive(Clone)]
pub struct LinkHandle {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    codec: FrameCodec,
    address: u8,
    command_timeout: Duration,
}

impl LinkHandle {
    /// Sends `command` and waits for the reader's reply.
    ///
    /// Commands are serialized: a second caller waits until the first one
    /// has its reply (or timed out).
    pub async fn send_command(&self, command: &Command) -> Result<Ack, CommandError> {
        let frame = self.codec.encode(command, self.address)?;
        let code = command.code();

        let _turn = self.gate.lock().await;
        if !self.shared.is_connected() {
            return Err(CommandError::LinkDown);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending() = Some(Pending {
            command: code,
            reply: reply_tx,
        });
        // The I/O thread marks the link down before failing the pending
        // reply, so one of the two checks catches a concurrent close.
        if !self.shared.is_connected() || self.outgoing.send(frame).is_err() {
            self.shared.pending().take();
            return Err(CommandError::LinkDown);
        }
        debug!(%command, "Command sent");

        match tokio::time::timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(result)) => {
                if let Err(e) = &result {
                    warn!(%command, error = %e, "Command failed");
                }
                result
            }
            Ok(Err(_)) => Err(CommandError::LinkDown),
            Err(_) => {
                self.shared.pending().take();
                warn!(
                    %command,
                    timeout_ms = self.command_timeout.as_millis() as u64,
                    "Command timed out"
                );
                Err(CommandError::Timeout {
                    command: code,
                    timeout_ms: self.command_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Watch channel of the link state.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the link is down, with the reason.
    pub async fn closed(&self) -> LinkError {
        let mut state = self.shared.state.subscribe();
        let result = state.wait_for(|s| !s.is_connected()).await;
        match result.as_deref() {
            Ok(LinkState::Disconnected(reason)) => reason.clone(),
            _ => LinkError::Closed,
        }
    }

    /// Asks the I/O thread to stop. In-flight commands fail with `LinkDown`;
    /// already decoded events are still delivered.
    pub fn close(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!("Serial link close requested");
        }
    }

    pub(crate) fn injector(&self) -> EventInjector {
        EventInjector {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.queue.dropped()
    }

    pub fn stats(&self) -> LinkStats {
        let counters = &self.shared.counters;
        LinkStats {
            frames_decoded: counters.frames.load(Ordering::Relaxed),
            decode_failures: counters.failures.load(Ordering::Relaxed),
            bytes_discarded: counters.discarded.load(Ordering::Relaxed),
            dropped_events: self.shared.queue.dropped(),
            queued_events: self.shared.queue.len(),
        }
    }
}

// =============================================================================
// Event Stream
// =============================================================================

/// Ordered sequence of decoded reader events.
///
/// Ends (`None`) once the link has closed and every event decoded before the
/// close has been delivered.
pub struct EventStream {
    shared: Arc<Shared>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<LinkEvent> {
        self.shared.queue.recv().await
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.queue.dropped()
    }

    pub fn into_stream(self) -> impl Stream<Item = LinkEvent> {
        futures_util::stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

// =============================================================================
// Serial Link
// =============================================================================

/// Entry points that start a link.
///
/// ## Usage
/// ```rust,ignore
/// let (link, mut events) = SerialLink::connect("/dev/ttyUSB0", 115_200, LinkConfig::default())?;
///
/// let ack = link.send_command(&Command::SetPower(PowerDbm::try_from(30)?)).await?;
///
/// while let Some(event) = events.next().await {
///     println!("{} at {:?}", event.message.type_name(), event.received_at);
/// }
/// ```
pub struct SerialLink;

impl SerialLink {
    /// Opens `path` and starts the link over it.
    pub fn connect(
        path: &str,
        baud_rate: u32,
        config: LinkConfig,
    ) -> Result<(LinkHandle, EventStream), ConnectError> {
        let port = port::open_port(path, baud_rate, config.read_timeout)?;
        info!(port = path, baud_rate, "Serial link connected");
        Self::spawn(port, config)
    }

    /// Starts the link over any [`ReaderPort`].
    pub fn spawn<P: ReaderPort>(
        port: P,
        config: LinkConfig,
    ) -> Result<(LinkHandle, EventStream), ConnectError> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LinkState::Connected);

        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.event_queue_capacity),
            pending: Mutex::new(None),
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
            state: state_tx,
        });

        let io = IoLoop {
            port,
            codec: FrameCodec::new(config.frame_format),
            shared: shared.clone(),
            outgoing: outgoing_rx,
            buffer: Vec::with_capacity(READ_CHUNK * 2),
            consecutive_failures: 0,
            max_failures: config.max_decode_failures.max(1),
            modem_line_sensors: config.modem_line_sensors,
            last_lines: None,
        };

        std::thread::Builder::new()
            .name("portal-serial-io".into())
            .spawn(move || io.run())
            .map_err(|e| ConnectError::Other {
                port: "I/O thread".into(),
                reason: e.to_string(),
            })?;

        let handle = LinkHandle {
            shared: shared.clone(),
            outgoing: outgoing_tx,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            codec: FrameCodec::new(config.frame_format),
            address: config.reader_address,
            command_timeout: config.command_timeout,
        };

        Ok((handle, EventStream { shared }))
    }
}

// =============================================================================
// I/O Thread
// =============================================================================

struct IoLoop<P> {
    port: P,
    codec: FrameCodec,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: Vec<u8>,
    consecutive_failures: u32,
    max_failures: u32,
    modem_line_sensors: bool,
    last_lines: Option<[bool; 2]>,
}

impl<P: ReaderPort> IoLoop<P> {
    fn run(mut self) {
        debug!("Serial I/O thread started");
        let reason = match self.pump() {
            Ok(()) => LinkError::Closed,
            Err(e) => e,
        };
        self.finish(reason);
    }

    fn pump(&mut self) -> Result<(), LinkError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            if !self.flush_outgoing()? {
                debug!("All link users gone, stopping I/O thread");
                return Ok(());
            }

            match self.port.read(&mut chunk) {
                Ok(0) => std::thread::sleep(IDLE_PAUSE),
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    self.drain_buffer()?;
                }
                Err(e) if port::is_idle(&e) => {}
                Err(e) => return Err(e.into()),
            }

            if self.modem_line_sensors {
                self.poll_sensor_lines()?;
            }
        }
    }

    /// Writes queued frames. Returns false once nobody can use the link.
    fn flush_outgoing(&mut self) -> Result<bool, LinkError> {
        loop {
            match self.outgoing.try_recv() {
                Ok(frame) => self.port.write_all(&frame)?,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(true),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // Handles are gone; keep running while an EventStream is held.
                    return Ok(Arc::strong_count(&self.shared) > 1);
                }
            }
        }
    }

    fn drain_buffer(&mut self) -> Result<(), LinkError> {
        let mut offset = 0;
        let result = loop {
            match self.codec.decode(&self.buffer[offset..]) {
                Decoded::Incomplete => break Ok(()),
                Decoded::Frame { message, consumed } => {
                    offset += consumed;
                    self.consecutive_failures = 0;
                    self.shared.counters.frames.fetch_add(1, Ordering::Relaxed);
                    self.dispatch(message);
                }
                Decoded::Unsupported { command, consumed } => {
                    offset += consumed;
                    self.consecutive_failures = 0;
                    debug!(command = format_args!("0x{:02X}", command), "Skipping unsupported frame");
                }
                Decoded::Invalid { error, consumed } => {
                    let consumed = consumed.max(1);
                    offset += consumed;
                    self.consecutive_failures += 1;
                    let counters = &self.shared.counters;
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    counters.discarded.fetch_add(consumed as u64, Ordering::Relaxed);
                    debug!(%error, consumed, "Decode failure, resynchronizing");

                    if self.consecutive_failures >= self.max_failures {
                        break Err(LinkError::Desynchronized {
                            failures: self.consecutive_failures,
                        });
                    }
                }
            }
        };
        self.buffer.drain(..offset.min(self.buffer.len()));
        result
    }

    fn dispatch(&mut self, message: Message) {
        let received_at = Instant::now();
        if let Some(command) = message.reply_to() {
            self.complete_pending(command, &message);
        }

        if !self.shared.queue.push(LinkEvent::new(message, received_at)) {
            let dropped = self.shared.queue.dropped();
            if dropped == 1 || dropped % 1000 == 0 {
                warn!(dropped, "Event queue full, dropping tag reads");
            }
        }
    }

    fn complete_pending(&self, command: u8, message: &Message) {
        let result = match message {
            Message::CommandAck(ack) if ack.is_success() => Ok(Ack {
                command: ack.command,
                status: ack.status,
                round: None,
            }),
            Message::CommandAck(ack) => Err(CommandError::Rejected {
                command: ack.command,
                status: ack.status,
            }),
            Message::InventoryRound(round) => Ok(Ack {
                command,
                status: STATUS_SUCCESS,
                round: Some(*round),
            }),
            // Per-antenna faults arrive mid-round; the round summary still
            // follows, so they do not answer the command.
            _ => return,
        };

        let mut pending = self.shared.pending();
        if pending.as_ref().is_some_and(|p| p.command == command) {
            if let Some(waiting) = pending.take() {
                let _ = waiting.reply.send(result);
            }
        }
    }

    fn poll_sensor_lines(&mut self) -> Result<(), LinkError> {
        let Some(levels) = self.port.sensor_lines()? else {
            return Ok(());
        };

        if let Some(previous) = self.last_lines {
            for sensor in [SensorId::One, SensorId::Two] {
                let i = sensor.index();
                if levels[i] != previous[i] {
                    let edge = SensorEdge {
                        sensor,
                        edge: Edge::from_level(levels[i]),
                    };
                    debug!(%sensor, edge = %edge.edge, "Sensor line changed");
                    self.dispatch(Message::SensorEdge(edge));
                }
            }
        }
        self.last_lines = Some(levels);
        Ok(())
    }

    fn finish(self, reason: LinkError) {
        match &reason {
            LinkError::Closed => info!("Serial link closed"),
            other => error!(reason = %other, "Serial link lost"),
        }

        self.shared.state.send_replace(LinkState::Disconnected(reason));
        if let Some(waiting) = self.shared.pending().take() {
            let _ = waiting.reply.send(Err(CommandError::LinkDown));
        }
        self.shared.queue.close();
    }
}
