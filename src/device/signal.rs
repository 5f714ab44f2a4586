//! Level-triggered flags shared by the backend loops.

use tokio::sync::watch;

/// A boolean that can be awaited until it becomes set.
///
/// Unlike `Notify`, a waiter arriving after `set` returns immediately.
#[derive(Debug)]
pub struct Flag {
    tx: watch::Sender<bool>,
}

impl Flag {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Flags coordinating the loops of one backend.
#[derive(Debug)]
pub struct Signals {
    /// Orderly shutdown requested
    pub stop: Flag,
    /// No reply is awaited; the sender may write
    pub clear_to_send: Flag,
    /// The hardware closed the connection
    pub remote_disconnected: Flag,
    pub auto_query_enabled: Flag,
    /// Makes the auto-querier re-evaluate before its timer expires
    pub wake_auto_query: Flag,
    /// The outbound buffer is not empty
    pub outbound_pending: Flag,
}

impl Signals {
    pub fn new() -> Self {
        Self {
            stop: Flag::new(false),
            clear_to_send: Flag::new(true),
            remote_disconnected: Flag::new(false),
            auto_query_enabled: Flag::new(true),
            wake_auto_query: Flag::new(false),
            outbound_pending: Flag::new(false),
        }
    }

    /// Resolves when the backend should wind down.
    pub async fn terminated(&self) {
        tokio::select! {
            _ = self.stop.wait() => {}
            _ = self.remote_disconnected.wait() => {}
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.stop.is_set() || self.remote_disconnected.is_set()
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_wait_on_set_flag_is_ready() {
        let flag = Flag::new(true);
        let mut fut = task::spawn(flag.wait());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let flag = Flag::default();
        let mut fut = task::spawn(flag.wait());
        assert_pending!(fut.poll());
        flag.set();
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }

    #[test]
    fn test_clear() {
        let flag = Flag::new(true);
        flag.clear();
        assert!(!flag.is_set());
    }

    #[tokio::test]
    async fn test_terminated_on_disconnect() {
        let signals = Signals::new();
        assert!(signals.clear_to_send.is_set());
        assert!(!signals.is_terminated());
        signals.remote_disconnected.set();
        tokio::time::timeout(Duration::from_secs(1), signals.terminated())
            .await
            .unwrap();
        assert!(signals.is_terminated());
    }
}
