//! # Inventory Session
//!
//! ```text
//!   ┌──────┐  begin_session   ┌─────────┐  end_session   ┌─────────┐
//!   │ Idle │ ───────────────► │ Running │ ─────────────► │ Stopped │
//!   └──────┘                  └─────────┘                └────┬────┘
//!      ▲                           ▲        begin_session     │
//!      │                           └──────────────────────────┤
//!      └──────────────────────── clear() ─────────────────────┘
//! ```
//!
//! `Running` is entered only after the reader acknowledged start-inventory;
//! records survive `Stopped` until `clear()`.

use std::fmt;

use chrono::{DateTime, Utc};
use portal_core::ReaderConfig;
use serde::Serialize;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop from the operator.
    Requested,
    /// The serial link went down or lost framing.
    LinkFailure(String),
    /// The reader stopped answering or rejected a command.
    CommandFailure(String),
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, StopReason::Requested)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stopped by request"),
            StopReason::LinkFailure(why) => write!(f, "link failure: {}", why),
            StopReason::CommandFailure(why) => write!(f, "command failure: {}", why),
        }
    }
}

/// Session phase without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::Running => write!(f, "running"),
            SessionPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Session lifecycle state held by the store.
#[derive(Debug, Clone)]
pub(crate) enum SessionState {
    Idle,
    Running {
        config: ReaderConfig,
        started_at: DateTime<Utc>,
    },
    Stopped {
        config: ReaderConfig,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
        reason: StopReason,
    },
}

impl SessionState {
    pub(crate) fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Running { .. } => SessionPhase::Running,
            SessionState::Stopped { .. } => SessionPhase::Stopped,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        match self {
            SessionState::Idle => SessionStatus {
                phase: SessionPhase::Idle,
                config: None,
                started_at: None,
                stopped_at: None,
                stop_reason: None,
            },
            SessionState::Running {
                config, started_at, ..
            } => SessionStatus {
                phase: SessionPhase::Running,
                config: Some(config.clone()),
                started_at: Some(*started_at),
                stopped_at: None,
                stop_reason: None,
            },
            SessionState::Stopped {
                config,
                started_at,
                stopped_at,
                reason,
            } => SessionStatus {
                phase: SessionPhase::Stopped,
                config: Some(config.clone()),
                started_at: Some(*started_at),
                stopped_at: Some(*stopped_at),
                stop_reason: Some(reason.clone()),
            },
        }
    }
}

/// Serializable view of the session for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub config: Option<ReaderConfig>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}
