//! # Sensor Port
//!
//! Portal sensors wired to their own serial adapter instead of the reader's
//! modem lines. The adapter prints `#1` or `#2` each time a beam is broken.
//!
//! ```text
//!  sensor adapter ── "#1\r\n" ──► portal-sensor-io thread
//!                                        │ SensorLineParser
//!                                        ▼
//!                                 S1 rising, S1 falling
//!                                        │
//!                                        ▼
//!                              link event queue ──► PortalEngine
//! ```
//!
//! A report carries no release, so each one becomes a short pulse: a rising
//! edge immediately followed by a falling edge. Sensor 1 then sensor 2
//! completes an inbound passage; the reverse order an outbound one.
//!
//! The sensor thread only holds the link weakly. It stops when the link
//! goes down, when its [`SensorHandle`] is stopped or dropped, or when the
//! sensor port fails. A failing sensor port never takes the reader link
//! down with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use portal_core::{Message, SensorEdge, SensorId};
use tracing::{debug, error, info};

use crate::error::ConnectError;
use crate::link::{EventInjector, LinkHandle};
use crate::port::{self, ReaderPort};

const SENSOR_READ_TIMEOUT: Duration = Duration::from_millis(20);
const IDLE_PAUSE: Duration = Duration::from_millis(1);
const READ_CHUNK: usize = 64;

// =============================================================================
// Line Parser
// =============================================================================

/// Extracts `#1` / `#2` reports from the sensor adapter's text stream.
///
/// Anything else on the line (CR/LF, banners, noise) is ignored. A `#` at the
/// end of one chunk pairs with a digit at the start of the next.
#[derive(Debug, Clone, Default)]
pub struct SensorLineParser {
    after_marker: bool,
}

impl SensorLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sensors reported in `bytes`, in arrival order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SensorId> {
        let mut reports = Vec::new();
        for &byte in bytes {
            if self.after_marker {
                match byte {
                    b'1' => reports.push(SensorId::One),
                    b'2' => reports.push(SensorId::Two),
                    _ => {}
                }
            }
            self.after_marker = byte == b'#';
        }
        reports
    }
}

// =============================================================================
// Sensor Port
// =============================================================================

/// Entry point for attaching a sensor adapter to a running link.
///
/// # Example
/// ```ignore
/// let (link, events) = SerialLink::connect("/dev/ttyUSB0", 115200, LinkConfig::default())?;
/// let sensors = SensorPort::connect("/dev/ttyUSB1", 115200, &link)?;
/// // S1/S2 edges now arrive on `events` alongside tag reads.
/// ```
pub struct SensorPort;

impl SensorPort {
    /// Opens `path` and forwards its reports into `link`'s event queue.
    pub fn connect(
        path: &str,
        baud_rate: u32,
        link: &LinkHandle,
    ) -> Result<SensorHandle, ConnectError> {
        let port = port::open_port(path, baud_rate, SENSOR_READ_TIMEOUT)?;
        info!(port = path, baud_rate, "Sensor port connected");
        Self::spawn(port, link)
    }

    /// Forwards reports from any [`ReaderPort`] into `link`'s event queue.
    pub fn spawn<P: ReaderPort>(port: P, link: &LinkHandle) -> Result<SensorHandle, ConnectError> {
        let stop = Arc::new(AtomicBool::new(false));
        let reader = SensorReader {
            port,
            parser: SensorLineParser::new(),
            injector: link.injector(),
            stop: stop.clone(),
        };

        let thread = std::thread::Builder::new()
            .name("portal-sensor-io".into())
            .spawn(move || reader.run())
            .map_err(|e| ConnectError::Other {
                port: "sensor thread".into(),
                reason: e.to_string(),
            })?;

        Ok(SensorHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Keeps the sensor thread running. Dropping it stops the thread.
pub struct SensorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SensorHandle {
    /// Asks the sensor thread to stop after its current read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the sensor thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SensorHandle {
    fn drop(&mut self) {
        self.stop();
        // Detach; the thread notices the flag within one read timeout.
        self.thread.take();
    }
}

// =============================================================================
// Sensor Thread
// =============================================================================

struct SensorReader<P> {
    port: P,
    parser: SensorLineParser,
    injector: EventInjector,
    stop: Arc<AtomicBool>,
}

impl<P: ReaderPort> SensorReader<P> {
    fn run(mut self) {
        debug!("Sensor thread started");
        let mut chunk = [0u8; READ_CHUNK];

        while !self.stop.load(Ordering::Acquire) && self.injector.is_open() {
            match self.port.read(&mut chunk) {
                Ok(0) => std::thread::sleep(IDLE_PAUSE),
                Ok(n) => {
                    if !self.forward(n, &chunk) {
                        break;
                    }
                }
                Err(e) if port::is_idle(&e) => {}
                Err(e) => {
                    error!(error = %e, "Sensor port failed");
                    break;
                }
            }
        }

        info!("Sensor port closed");
    }

    /// Queues one pulse per report. Returns false once the link is down.
    fn forward(&mut self, n: usize, chunk: &[u8]) -> bool {
        for sensor in self.parser.feed(&chunk[..n]) {
            debug!(%sensor, "Sensor triggered");
            let pulse = [SensorEdge::rising(sensor), SensorEdge::falling(sensor)];
            for edge in pulse {
                if !self.injector.push(Message::SensorEdge(edge)) {
                    return false;
                }
            }
        }
        true
    }
}
