//! # Command Retry
//!
//! Re-sends a command whose reply timed out.
//!
//! ```text
//!   attempt 1 ── Timeout ──► wait ~100ms ──► attempt 2 ── Timeout ──► wait ~200ms
//!       ──► attempt 3 ── Timeout ──► give up (retries = 2)
//!
//!   Rejected / LinkDown / Invalid ──► returned immediately
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use portal_core::Command;
use tracing::debug;

use crate::error::CommandError;
use crate::link::{Ack, LinkHandle};

/// How often and how patiently a command is re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        RetryPolicy {
            retries,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

/// Sends `command`, retrying only errors that are worth retrying.
pub async fn send_with_retry(
    link: &LinkHandle,
    command: &Command,
    policy: &RetryPolicy,
) -> Result<Ack, CommandError> {
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        match link.send_command(command).await {
            Ok(ack) => return Ok(ack),
            Err(e) if e.is_retryable() && attempt < policy.retries => {
                attempt += 1;
                let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
                debug!(%command, attempt, ?delay, "Retrying command");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
