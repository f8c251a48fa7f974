//! # Validation Module
//!
//! Range checks for every value the reader accepts.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Config file (portal.toml)                                    │
//! │  └── serde newtypes reject out-of-range values on load                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: THIS MODULE                                                  │
//! │  ├── Antenna / GPIO pin / sensor numbers                               │
//! │  ├── Power, RF profile, manual channel range                           │
//! │  └── Analysis thresholds                                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Codec                                                        │
//! │  └── Inbound frames with out-of-range ids are Malformed                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use portal_core::validation::{validate_power, validate_antenna};
//!
//! assert!(validate_power(30).is_ok());
//! assert!(validate_antenna(5).is_err());
//! ```

use crate::error::ValidationError;
use crate::{ANTENNA_COUNT, GPIO_PIN_COUNT, MAX_CHANNEL, MAX_EPC_BYTES, MAX_POWER_DBM};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Reader Values
// =============================================================================

/// Validates an antenna number (1 through 4).
pub fn validate_antenna(antenna: u8) -> ValidationResult<()> {
    check_range("antenna", antenna as i64, 1, ANTENNA_COUNT as i64)
}

/// Validates a GPIO output pin (1 through 4).
pub fn validate_gpio_pin(pin: u8) -> ValidationResult<()> {
    check_range("gpio_pin", pin as i64, 1, GPIO_PIN_COUNT as i64)
}

/// Validates transmit power in dBm (0 through 33).
pub fn validate_power(dbm: u8) -> ValidationResult<()> {
    check_range("power_dbm", dbm as i64, 0, MAX_POWER_DBM as i64)
}

/// Validates an RF profile number (0 through 3).
pub fn validate_rf_profile(profile: u8) -> ValidationResult<()> {
    check_range("rf_profile", profile as i64, 0, 3)
}

/// Validates a manual channel range.
///
/// ## Rules
/// - `end` must not exceed the last US channel (0x3B)
/// - `start` must not exceed `end`
pub fn validate_channel_range(start: u8, end: u8) -> ValidationResult<()> {
    check_range("region.end", end as i64, 0, MAX_CHANNEL as i64)?;
    check_range("region.start", start as i64, 0, end as i64)
}

/// Validates an EPC byte string.
///
/// ## Rules
/// - Must not be empty
/// - At most 62 bytes (496-bit EPC bank)
pub fn validate_epc(epc: &[u8]) -> ValidationResult<()> {
    if epc.is_empty() {
        return Err(ValidationError::Required {
            field: "epc".to_string(),
        });
    }
    check_range("epc length", epc.len() as i64, 1, MAX_EPC_BYTES as i64)
}

// =============================================================================
// Analysis Values
// =============================================================================

/// Validates a finite, non-negative threshold.
pub fn validate_threshold(field: &str, value: f64) -> ValidationResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("must be a finite non-negative number, got {}", value),
        });
    }
    Ok(())
}

/// Validates a ring-buffer capacity. Regression needs at least two samples.
pub fn validate_window_size(size: usize) -> ValidationResult<()> {
    check_range("window_size", size as i64, 2, 4096)
}

/// Validates the sample count a window needs before it votes: at least two,
/// and no more than one antenna window can hold.
pub fn validate_min_samples(min_samples: usize, window_size: usize) -> ValidationResult<()> {
    check_range("min_samples", min_samples as i64, 2, window_size as i64)
}

fn check_range(field: &str, value: i64, min: i64, max: i64) -> ValidationResult<()> {
    if value < min || value > max {
        return Err(ValidationError::out_of_range(field, min, max, value));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
