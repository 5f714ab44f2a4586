//! Periodic refresh of variables whose values went stale.

use super::protocol::{query_variable, run_deferred, DeviceProtocol};
use super::state::DeviceState;
use super::Shared;
use crate::error::AppResult;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// One auto-querier cycle.
pub(crate) async fn run(shared: &Shared) -> AppResult<bool> {
    let signals = &shared.signals;
    signals.wake_auto_query.clear();
    let delay = shared
        .state
        .borrow()
        .variables()
        .next_poll_delay(Instant::now(), shared.settings.fast_poll_interval);

    let due = async {
        tokio::select! {
            _ = sleep_for(delay) => {}
            _ = signals.wake_auto_query.wait() => {}
        }
        signals.auto_query_enabled.wait().await;
    };
    let terminated = tokio::select! {
        _ = signals.terminated() => true,
        _ = due => false,
    };
    if terminated {
        return Ok(false);
    }

    // may have been switched off while the timer ran
    if !signals.auto_query_enabled.is_set() {
        debug!(device = %shared.settings.name, "Auto-query disabled");
        return Ok(true);
    }

    let mut protocol = shared.protocol.borrow_mut();
    let mut state = shared.state.borrow_mut();
    issue_due_queries(&mut **protocol, &mut state, Instant::now());
    run_deferred(&mut **protocol, &mut state);
    Ok(true)
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Queries overdue variables in priority order until the outbound buffer is
/// full. Returns the number of variables queried.
pub fn issue_due_queries(
    protocol: &mut dyn DeviceProtocol,
    device: &mut DeviceState,
    now: Instant,
) -> usize {
    let mut issued = 0;
    for name in device.variables().query_candidates(now) {
        if device.outbuffer_full() {
            device.warning("Skipping query: full output buffer");
            break;
        }
        match query_variable(protocol, device, &name, false) {
            Ok(()) => issued += 1,
            Err(e) => device.error(format!("Cannot query variable {name}: {e}")),
        }
    }
    issued
}
