//! # Error Types
//!
//! Error types for portal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  portal-core errors (this file)                                        │
//! │  ├── CoreError        - Umbrella for the crate                         │
//! │  ├── DecodeError      - Framing/payload failures (transient)           │
//! │  └── ValidationError  - Out-of-range configuration or command values   │
//! │                                                                         │
//! │  portal-store errors (separate crate)                                  │
//! │  └── StoreError       - Session lifecycle violations                   │
//! │                                                                         │
//! │  portal-link errors (separate crate)                                   │
//! │  └── ConnectError / CommandError / LinkError / EngineError             │
//! │                                                                         │
//! │  Flow: DecodeError → resync (link) → Desynchronized after threshold    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Umbrella error for portal-core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Decode Error
// =============================================================================

/// Failures while turning raw bytes into a typed message.
///
/// Decode errors are transient: the serial link discards the consumed bytes
/// and tries again from the next sync byte.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Bytes before the next sync byte were skipped.
    ///
    /// ## When This Occurs
    /// - Line noise between frames
    /// - The link was opened in the middle of a frame
    #[error("Skipped {skipped} bytes while searching for sync byte")]
    MissingSync { skipped: usize },

    /// The length byte cannot describe a valid frame.
    #[error("Impossible frame length byte: {declared}")]
    BadLength { declared: u8 },

    /// The trailing checksum does not match the frame contents.
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// The frame is intact but its payload violates the message layout.
    ///
    /// ## When This Occurs
    /// - Sensor id other than 1 or 2
    /// - Unknown edge code
    /// - EPC with an odd byte count
    #[error("Malformed payload for command 0x{command:02X}: {reason}")]
    Malformed { command: u8, reason: String },
}

impl DecodeError {
    /// Returns true if the failure came from framing (sync, length, checksum)
    /// rather than from the payload of an otherwise valid frame.
    pub fn is_framing_error(&self) -> bool {
        !matches!(self, DecodeError::Malformed { .. })
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Raised when a configuration or command value falls outside what the reader
/// accepts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: String,
        min: i64,
        max: i64,
        value: i64,
    },

    /// Invalid format (e.g., non-hex EPC).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

impl ValidationError {
    pub(crate) fn out_of_range(field: &str, min: i64, max: i64, value: i64) -> Self {
        ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
            value,
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
