//! Writes queued messages to the hardware, one request at a time.

use super::Shared;
use crate::error::AppResult;
use crate::error_recovery::RetryDecision;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

enum Wake {
    Terminated,
    ReplyTimeout,
    ClearToSend,
}

/// One sender cycle. Returns `Ok(false)` once the backend winds down.
pub(crate) async fn run(shared: &Shared) -> AppResult<bool> {
    let signals = &shared.signals;
    let deadline = shared
        .link
        .borrow()
        .reply_deadline(shared.policy.reply_timeout);

    let wake = tokio::select! {
        biased;
        _ = signals.terminated() => Wake::Terminated,
        _ = sleep_until_some(deadline) => Wake::ReplyTimeout,
        _ = clear_to_send(shared) => Wake::ClearToSend,
    };

    match wake {
        Wake::Terminated => Ok(false),
        Wake::ReplyTimeout => {
            retransmit(shared).await?;
            Ok(true)
        }
        Wake::ClearToSend => {
            send_next(shared).await?;
            Ok(true)
        }
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves when there is something to send and no reply is awaited.
async fn clear_to_send(shared: &Shared) {
    let signals = &shared.signals;
    loop {
        signals.clear_to_send.wait().await;
        signals.outbound_pending.wait().await;
        if signals.clear_to_send.is_set() {
            return;
        }
    }
}

async fn retransmit(shared: &Shared) -> AppResult<()> {
    let now = Instant::now();
    let (message, attempt) = {
        let mut link = shared.link.borrow_mut();
        match link.reply_deadline(shared.policy.reply_timeout) {
            // a reply arrived or the deadline moved in the meantime
            Some(deadline) if deadline <= now => {}
            _ => return Ok(()),
        }
        let attempt = match link.retries.on_timeout(&shared.policy) {
            RetryDecision::GiveUp => {
                let message = link.in_flight_message().unwrap_or_default();
                return Err(link.retries.exhausted(message));
            }
            RetryDecision::Retransmit(attempt) => attempt,
        };
        match link.rearm() {
            Some(message) => (message, attempt),
            None => return Ok(()),
        }
    };

    if attempt > 1 {
        shared.state.borrow().warning(format!(
            "Reply timeout, retrying sending of message {} (retry {attempt} of {})",
            message.escape_ascii(),
            shared.policy.max_retries
        ));
    }
    transmit(shared, &message).await
}

async fn send_next(shared: &Shared) -> AppResult<()> {
    let Some(pending) = shared.state.borrow_mut().next_outbound() else {
        return Ok(());
    };
    pace(shared).await;
    let awaits_reply = shared.link.borrow_mut().sent(
        pending.message.clone(),
        pending.expected_replies,
        Instant::now(),
    );
    if awaits_reply {
        shared.signals.clear_to_send.clear();
    }
    transmit(shared, &pending.message).await
}

/// Keeps consecutive sends at least `min_send_interval` apart.
async fn pace(shared: &Shared) {
    let interval = shared.settings.min_send_interval;
    if interval.is_zero() {
        return;
    }
    let last_send = shared.link.borrow().last_send;
    if let Some(last_send) = last_send {
        sleep_until(last_send + interval).await;
    }
}

async fn transmit(shared: &Shared, message: &Bytes) -> AppResult<()> {
    shared.link.borrow_mut().last_send = Some(Instant::now());
    shared
        .state
        .borrow_mut()
        .telemetry
        .record_send(message.len());
    trace!(device = %shared.settings.name, message = %message.escape_ascii(), "Sending");

    let mut writer = shared.writer.lock().await;
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}
