//! # Store Error Types
//!
//! Error types for inventory store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  InventoryStore call outside the allowed session phase                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module)                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  EngineError (portal-link) ← logged, session reason recorded           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use portal_core::TagIdentity;

use crate::session::SessionPhase;

/// Inventory store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The operation is not allowed while a session is running.
    ///
    /// ## When This Occurs
    /// - `clear()` during a session
    /// - `begin_session()` twice
    #[error("Inventory session is running")]
    SessionRunning,

    /// Tag samples can only be recorded during a running session.
    #[error("No inventory session is running (session is {phase})")]
    SessionNotRunning { phase: SessionPhase },

    /// The store holds as many distinct tags as it is allowed to.
    #[error("Inventory is full: {max} distinct tags")]
    CapacityExceeded { max: usize },

    /// The reader reported a placeholder EPC instead of a real tag.
    #[error("Placeholder EPC {epc} is not inventoried")]
    PlaceholderTag { epc: TagIdentity },
}

impl StoreError {
    /// Returns true if the error reflects the session phase rather than data.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            StoreError::SessionRunning | StoreError::SessionNotRunning { .. }
        )
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
