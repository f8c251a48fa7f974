//! # Reader Port
//!
//! Byte-level access to the reader, plus serial port discovery.
//!
//! The I/O thread only needs three things from a port: read with a short
//! timeout, write a whole frame, and (optionally) sample the two modem input
//! lines the portal sensors may be wired to. [`ReaderPort`] is that surface;
//! real hardware goes through `serialport`, tests use an in-memory script.
//!
//! ## Port Detection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    detect_reader_port() scoring                         │
//! │                                                                         │
//! │  name contains ttyUSB / USB ............................ +10            │
//! │  name contains ttyACM .................................. +5             │
//! │  product mentions CP210 / CH340 / FTDI / PL2303 /                       │
//! │                   RFID / reader ........................ +15            │
//! │  manufacturer mentions Silicon Labs / FTDI / WCH /                      │
//! │                        Prolific ........................ +10            │
//! │                                                                         │
//! │  Highest positive score wins; ties keep enumeration order.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::error::ConnectError;

// =============================================================================
// Port Abstraction
// =============================================================================

/// Transport under the serial link. Driven from a single blocking thread.
pub trait ReaderPort: Send + 'static {
    /// Reads available bytes. `TimedOut` or `WouldBlock` means no data yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one complete frame.
    fn write_all(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Current levels of the sensor inputs `[sensor 1, sensor 2]`, if this
    /// port carries them.
    fn sensor_lines(&mut self) -> io::Result<Option<[bool; 2]>> {
        Ok(None)
    }
}

impl ReaderPort for Box<dyn serialport::SerialPort> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, frame: &[u8]) -> io::Result<()> {
        Write::write_all(self, frame)?;
        Write::flush(self)
    }

    /// Sensor 1 on CTS, sensor 2 on DSR.
    fn sensor_lines(&mut self) -> io::Result<Option<[bool; 2]>> {
        let cts = self.read_clear_to_send().map_err(io::Error::from)?;
        let dsr = self.read_data_set_ready().map_err(io::Error::from)?;
        Ok(Some([cts, dsr]))
    }
}

/// No data within the read timeout. Not a port failure.
pub(crate) fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Opens `path` as 8N1 without flow control, with DTR and RTS asserted.
pub fn open_port(
    path: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, ConnectError> {
    let mut port = serialport::new(path, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(read_timeout)
        .open()
        .map_err(|e| ConnectError::from_serial(path, e))?;

    port.write_data_terminal_ready(true)
        .map_err(|e| ConnectError::from_serial(path, e))?;
    port.write_request_to_send(true)
        .map_err(|e| ConnectError::from_serial(path, e))?;

    debug!(port = path, baud_rate, "Serial port opened");
    Ok(port)
}

// =============================================================================
// Discovery
// =============================================================================

/// One serial port visible to the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: String,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl PortInfo {
    fn from_serial(info: serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        match info.port_type {
            SerialPortType::UsbPort(usb) => PortInfo {
                name: info.port_name,
                kind: "usb".into(),
                product: usb.product,
                manufacturer: usb.manufacturer,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            },
            other => PortInfo {
                name: info.port_name,
                kind: match other {
                    SerialPortType::PciPort => "pci",
                    SerialPortType::BluetoothPort => "bluetooth",
                    _ => "unknown",
                }
                .into(),
                product: None,
                manufacturer: None,
                vid: None,
                pid: None,
            },
        }
    }

    /// Likelihood that this port is the reader's USB-serial bridge.
    pub fn reader_score(&self) -> u32 {
        const BRIDGE_PRODUCTS: [&str; 6] = ["cp210", "ch340", "ftdi", "pl2303", "rfid", "reader"];
        const BRIDGE_VENDORS: [&str; 4] = ["silicon labs", "ftdi", "wch", "prolific"];

        let mut score = 0;
        if self.name.contains("ttyUSB") || self.name.contains("USB") {
            score += 10;
        }
        if self.name.contains("ttyACM") {
            score += 5;
        }
        let product = self.product.as_deref().unwrap_or_default().to_lowercase();
        if BRIDGE_PRODUCTS.iter().any(|p| product.contains(p)) {
            score += 15;
        }
        let vendor = self.manufacturer.as_deref().unwrap_or_default().to_lowercase();
        if BRIDGE_VENDORS.iter().any(|v| vendor.contains(v)) {
            score += 10;
        }
        score
    }
}

/// Lists the serial ports visible to the system.
pub fn list_ports() -> Result<Vec<PortInfo>, ConnectError> {
    let ports = serialport::available_ports().map_err(|e| ConnectError::Other {
        port: "*".into(),
        reason: e.description,
    })?;
    Ok(ports.into_iter().map(PortInfo::from_serial).collect())
}

/// Picks the most reader-like port, if any scores above zero.
pub fn best_reader_port(ports: &[PortInfo]) -> Option<&PortInfo> {
    ports
        .iter()
        .filter(|p| p.reader_score() > 0)
        .fold(None, |best: Option<&PortInfo>, p| match best {
            Some(b) if b.reader_score() >= p.reader_score() => Some(b),
            _ => Some(p),
        })
}

/// Finds the serial port the reader is most likely attached to.
pub fn detect_reader_port() -> Result<Option<PortInfo>, ConnectError> {
    let ports = list_ports()?;
    let best = best_reader_port(&ports).cloned();
    if let Some(port) = &best {
        debug!(port = %port.name, score = port.reader_score(), "Reader port detected");
    }
    Ok(best)
}
