//! Request/reply bookkeeping of the hardware link.

use crate::error_recovery::RetryCounter;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;

/// The message whose replies are awaited.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub message: Bytes,
    pub expected: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LinkState {
    pub last_send: Option<Instant>,
    pub last_recv: Option<Instant>,
    pub retries: RetryCounter,
    pub in_flight: Option<InFlight>,
    /// Received bytes not yet forming a complete frame
    pub inbuffer: BytesMut,
}

impl LinkState {
    /// Records a message just written to the socket. Returns whether the
    /// sender must wait for replies before writing again.
    pub fn sent(&mut self, message: Bytes, expected: usize, now: Instant) -> bool {
        self.last_send = Some(now);
        if expected == 0 {
            self.in_flight = None;
            return false;
        }
        self.in_flight = Some(InFlight {
            message,
            expected,
            remaining: expected,
        });
        true
    }

    /// When the in-flight message counts as unanswered.
    pub fn reply_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.in_flight.as_ref()?;
        let reference = match (self.last_send, self.last_recv) {
            (Some(send), Some(recv)) => send.max(recv),
            (Some(send), None) => send,
            (None, Some(recv)) => recv,
            (None, None) => return None,
        };
        Some(reference + timeout)
    }

    pub fn received(&mut self, now: Instant) {
        self.last_recv = Some(now);
        self.retries.reset();
    }

    /// Counts `frames` replies against the in-flight message. Returns true if
    /// the link is clear to send afterwards.
    pub fn consume_replies(&mut self, frames: usize) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return true;
        };
        in_flight.remaining = in_flight.remaining.saturating_sub(frames);
        if in_flight.remaining == 0 {
            self.in_flight = None;
            return true;
        }
        false
    }

    /// Prepares the in-flight message for retransmission.
    pub fn rearm(&mut self) -> Option<Bytes> {
        let in_flight = self.in_flight.as_mut()?;
        in_flight.remaining = in_flight.expected;
        Some(in_flight.message.clone())
    }

    pub fn in_flight_message(&self) -> Option<&[u8]> {
        self.in_flight.as_ref().map(|f| f.message.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_reopen_the_gate() {
        let mut link = LinkState::default();
        let now = Instant::now();
        assert!(link.sent(Bytes::from_static(b"MV 1\r"), 2, now));
        assert!(!link.consume_replies(1));
        assert!(link.in_flight_message().is_some());
        assert!(link.consume_replies(1));
        assert!(link.in_flight_message().is_none());
    }

    #[test]
    fn test_zero_replies_never_close_the_gate() {
        let mut link = LinkState::default();
        assert!(!link.sent(Bytes::from_static(b"RESET\r"), 0, Instant::now()));
        assert!(link.in_flight.is_none());
        assert!(link.reply_deadline(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_deadline_follows_latest_traffic() {
        let mut link = LinkState::default();
        let t0 = Instant::now();
        let timeout = Duration::from_millis(100);
        link.sent(Bytes::from_static(b"Q\r"), 3, t0);
        assert_eq!(link.reply_deadline(timeout), Some(t0 + timeout));

        let t1 = t0 + Duration::from_millis(80);
        link.received(t1);
        assert!(!link.consume_replies(1));
        assert_eq!(link.reply_deadline(timeout), Some(t1 + timeout));
    }

    #[test]
    fn test_rearm_restores_expected_count() {
        let mut link = LinkState::default();
        link.sent(Bytes::from_static(b"Q\r"), 2, Instant::now());
        link.consume_replies(1);
        assert_eq!(link.rearm(), Some(Bytes::from_static(b"Q\r")));
        assert_eq!(link.in_flight.as_ref().map(|f| f.remaining), Some(2));
    }
}
