//! # portal-core: Pure Logic for the RFID Portal
//!
//! This crate is the **heart** of the portal. It turns reader bytes into typed
//! messages, RSSI samples into detection votes, and sensor edges into IN/OUT
//! events, all as pure functions over values and injected timestamps.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        RFID Portal Architecture                         │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                portal-link (serial I/O + engine)                │   │
//! │  │    I/O thread ──► event queue ──► engine ──► publisher          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ portal-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   codec   │  │ analyzer  │  │ direction │  │ validation│  │   │
//! │  │   │  Frame    │  │  slope    │  │  S1/S2    │  │  ranges   │  │   │
//! │  │   │  Message  │  │  variance │  │  state    │  │           │  │   │
//! │  │   │  Command  │  │  2-of-3   │  │  machine  │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO PORTS • NO THREADS • NO CLOCK READS • PURE FUNCTIONS      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                portal-store (TagRecord ownership)               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (TagIdentity, AntennaId, ReaderConfig, etc.)
//! - [`codec`] - Frame encode/decode for the R2000-family serial protocol
//! - [`analyzer`] - RSSI slope/variance metrics and 2-of-3 voting
//! - [`direction`] - Dual-sensor direction state machine
//! - [`error`] - Error types
//! - [`validation`] - Range checks
//!
//! ## Example Usage
//!
//! ```rust
//! use portal_core::codec::{Command, Decoded, FrameCodec};
//! use portal_core::types::PowerDbm;
//!
//! let codec = FrameCodec::default();
//! let power = PowerDbm::try_from(30).unwrap();
//! let frame = codec.encode(&Command::SetPower(power), 0xFF).unwrap();
//! assert_eq!(frame[0], 0xA0);
//!
//! // A half-received frame decodes as Incomplete and consumes nothing.
//! assert!(matches!(codec.decode(&frame[..3]), Decoded::Incomplete));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod analyzer;
pub mod codec;
pub mod direction;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use analyzer::{AnalyzerConfig, SignalAnalyzer, SignalMetrics, TagSignal, VoteVector};
pub use codec::{Command, Decoded, FrameCodec, FrameFormat, Message};
pub use direction::{DirectionConfig, DirectionDetector, DirectionEvent, PortalState};
pub use error::{CoreError, DecodeError, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Number of antenna ports on the reader.
pub const ANTENNA_COUNT: usize = 4;

/// Number of GPIO output pins.
pub const GPIO_PIN_COUNT: usize = 4;

/// Highest accepted transmit power.
pub const MAX_POWER_DBM: u8 = 33;

/// Last channel index of the widest (US) frequency plan.
pub const MAX_CHANNEL: u8 = 0x3B;

/// Largest EPC bank the reader reports (496 bits).
pub const MAX_EPC_BYTES: usize = 62;

/// Offset of the raw RSSI byte: `dBm = raw - RSSI_DBM_OFFSET`.
pub const RSSI_DBM_OFFSET: i16 = 129;

/// Address that every reader answers to.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Status byte of a successful command.
pub const STATUS_SUCCESS: u8 = 0x10;

/// Default serial speed of the reader.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
