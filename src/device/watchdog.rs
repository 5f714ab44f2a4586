//! Periodic telemetry and detection of a stuck link.

use super::Shared;
use crate::error::{AppResult, DaqError};
use crate::health::{TelemetryFrame, TelemetrySnapshot};
use crate::messages::DeviceEvent;
use tokio::time::{sleep, Instant};

/// Sleeps one telemetry period, then reports.
pub(crate) async fn run(shared: &Shared) -> AppResult<bool> {
    let period = if shared.state.borrow().is_ready() {
        shared.settings.telemetry_period
    } else {
        shared.settings.telemetry_pending_period
    };
    let terminated = tokio::select! {
        _ = shared.signals.terminated() => true,
        _ = sleep(period) => false,
    };
    if terminated {
        return Ok(false);
    }
    report(shared)?;
    Ok(true)
}

/// Closes the current telemetry frame, sends it to the owner and starts a new
/// one. Fails if queries have been outstanding for too long while
/// auto-query is on.
pub(crate) fn report(shared: &Shared) -> AppResult<()> {
    let now = Instant::now();
    let signals = &shared.signals;
    let mut state = shared.state.borrow_mut();
    let link = shared.link.borrow();

    let frame = std::mem::replace(&mut state.telemetry, TelemetryFrame::start(now));
    let mut snapshot: TelemetrySnapshot = frame.finish(now);
    let outstanding = state.variables().outstanding_ages(now);
    snapshot.missing_variables = state.variables().missing_values();
    snapshot.outdated_queries = outstanding
        .iter()
        .filter(|(_, age)| *age > shared.settings.telemetry_period)
        .map(|(name, age)| (name.clone(), age.as_secs_f64()))
        .collect();
    snapshot.overdue_variables = state.variables().overdue_ages(now).into_iter().collect();
    snapshot.outbuffer_length = state.outbuffer_len();
    snapshot.autoquery_inhibited = !signals.auto_query_enabled.is_set();
    snapshot.clear_to_send = signals.clear_to_send.is_set();
    snapshot.socket_eof = signals.remote_disconnected.is_set();
    snapshot.last_message = link
        .in_flight_message()
        .map(|message| message.escape_ascii().to_string());
    snapshot.last_send_age = link
        .last_send
        .map(|t| now.saturating_duration_since(t).as_secs_f64());
    snapshot.last_recv_age = link
        .last_recv
        .map(|t| now.saturating_duration_since(t).as_secs_f64());
    let (process_id, memory_bytes) = shared.sampler.borrow_mut().sample();
    snapshot.process_id = process_id;
    snapshot.memory_bytes = memory_bytes;
    state.emit(DeviceEvent::Telemetry {
        telemetry: Box::new(snapshot),
    });

    if signals.auto_query_enabled.is_set() {
        let mut stuck: Vec<String> = outstanding
            .into_iter()
            .filter(|(_, age)| *age > shared.settings.outstanding_query_fail_timeout)
            .map(|(name, _)| name)
            .collect();
        if !stuck.is_empty() {
            stuck.sort();
            return Err(DaqError::LinkDead(stuck));
        }
    }
    Ok(())
}
