//! # portal-store: Tag Inventory for the RFID Portal
//!
//! This crate owns every [`TagRecord`] and the inventory session lifecycle.
//! The engine writes through it; the snapshot publisher and the CLI read
//! point-in-time copies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   engine task ──── upsert(tag, sample) ────┐                           │
//! │                                             ▼                           │
//! │                      ┌──────────────────────────────────┐               │
//! │                      │   ★ InventoryStore (THIS) ★      │               │
//! │                      │                                  │               │
//! │                      │   HashMap<TagIdentity, Record>   │               │
//! │                      │   SessionState                   │               │
//! │                      │   SignalAnalyzer (session ants)  │               │
//! │                      └────────────────┬─────────────────┘               │
//! │                                       │ snapshot() / summaries()        │
//! │                                       ▼                                 │
//! │                    publisher, CLI, direction correlation                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`inventory`] - `InventoryStore` with session control and upsert
//! - [`record`] - Per-tag record and its serializable summary row
//! - [`session`] - Session phases and stop reasons
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Instant;
//! use portal_core::{AntennaId, ReaderConfig, RssiSample, TagIdentity};
//! use portal_store::{InventoryStore, StopReason};
//!
//! let store = InventoryStore::default();
//! store.begin_session(ReaderConfig::default()).unwrap();
//!
//! let epc: TagIdentity = "E20034120000".parse().unwrap();
//! let outcome = store
//!     .upsert(epc, RssiSample::new(AntennaId::ONE, -55, Instant::now()))
//!     .unwrap();
//! assert!(outcome.is_new);
//!
//! store.end_session(StopReason::Requested).unwrap();
//! assert_eq!(store.clear().unwrap(), 1);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod inventory;
pub mod record;
pub mod session;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use inventory::{InventoryStore, StoreConfig, UpsertOutcome};
pub use record::{TagRecord, TagSummary};
pub use session::{SessionPhase, SessionStatus, StopReason};

/// Distinct tags held per session unless configured otherwise.
pub const DEFAULT_MAX_TAGS: usize = 10_000;
