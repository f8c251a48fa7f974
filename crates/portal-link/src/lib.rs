//! # portal-link: Serial Link & Processing Engine
//!
//! Everything that touches the outside world: the serial port, the dedicated
//! I/O thread, the async processing task, snapshot publication and the
//! configuration file.
//!
//! ## Data Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   serial port                                                           │
//! │       │ bytes                                                           │
//! │       ▼                                                                 │
//! │  ┌──────────────┐  LinkEvent   ┌──────────────┐  upsert   ┌──────────┐ │
//! │  │  SerialLink  │─────────────►│ PortalEngine │──────────►│Inventory │ │
//! │  │  I/O thread  │  (bounded,   │  async task  │           │  Store   │ │
//! │  │  decode      │  drops reads)│  direction   │           └────┬─────┘ │
//! │  └──────▲───────┘              └──────┬───────┘                │       │
//! │         │ commands                    │ DirectionEvent         │       │
//! │  ┌──────┴───────┐                     ▼                        ▼       │
//! │  │  LinkHandle  │              broadcast channel      SnapshotPublisher│
//! │  │  (one in     │                                      (watch channel) │
//! │  │   flight)    │                                                      │
//! │  └──────────────┘                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] - TOML + environment configuration
//! - [`link`] - Serial I/O thread and command correlation
//! - [`engine`] - Inventory sessions and direction detection
//! - [`publisher`] - Periodic inventory snapshots
//! - [`port`] - Port enumeration and opening
//! - [`retry`] - Command retry with backoff
//! - [`sensor`] - `#1`/`#2` sensor adapter on its own serial port
//! - [`error`] - Error types

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod port;
pub mod publisher;
pub mod retry;
pub mod sensor;

mod queue;

pub use config::PortalConfig;
pub use engine::{EngineConfig, EngineHandle, EngineStatus, PortalEngine};
pub use error::{
    CommandError, ConfigError, ConfigResult, ConnectError, EngineError, EngineResult, LinkError,
};
pub use link::{Ack, EventStream, LinkConfig, LinkHandle, LinkState, LinkStats, SerialLink};
pub use port::{PortInfo, ReaderPort};
pub use publisher::{InventorySnapshot, SnapshotPublisher};
pub use queue::LinkEvent;
pub use retry::{send_with_retry, RetryPolicy};
pub use sensor::{SensorHandle, SensorLineParser, SensorPort};
