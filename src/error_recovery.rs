//! Reply-timeout recovery for hardware messages.
//
// Unanswered messages are re-sent unchanged. Once the retry budget is spent
// the link counts as broken, which ends the worker.

use crate::error::DaqError;
use std::time::Duration;

/// Defines how long to wait for replies and how often to retry.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of retransmissions of one message.
    pub max_retries: u32,
    /// How long to wait for a reply before retransmitting.
    pub reply_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            reply_timeout: Duration::from_secs(1),
        }
    }
}

/// What to do when a reply timeout fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the in-flight message again; carries the attempt number (1-based).
    Retransmit(u32),
    /// The budget is exhausted.
    GiveUp,
}

/// Counts consecutive retransmissions of the in-flight message.
#[derive(Debug, Default)]
pub struct RetryCounter {
    retries: u32,
}

impl RetryCounter {
    /// Called on reply timeout.
    pub fn on_timeout(&mut self, policy: &RetryPolicy) -> RetryDecision {
        if self.retries >= policy.max_retries {
            return RetryDecision::GiveUp;
        }
        self.retries += 1;
        RetryDecision::Retransmit(self.retries)
    }

    /// Any data from the hardware proves the link is alive.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// Number of retransmissions since the last received data.
    pub fn count(&self) -> u32 {
        self.retries
    }

    /// Builds the fatal error reported when retries are exhausted.
    pub fn exhausted(&self, message: &[u8]) -> DaqError {
        DaqError::ReplyTimeout {
            retries: self.retries,
            message: format!("{:?}", bytes::Bytes::copy_from_slice(message)),
        }
    }
}
