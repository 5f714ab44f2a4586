//! Reads from the hardware, frames the stream and dispatches replies.

use super::protocol::run_deferred;
use super::Shared;
use crate::error::AppResult;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, trace};

/// One receiver cycle. Returns `Ok(false)` on stop or when the hardware
/// closed the connection.
pub(crate) async fn run(shared: &Shared) -> AppResult<bool> {
    let mut chunk = vec![0u8; shared.settings.read_chunk_size];
    let read = tokio::select! {
        _ = shared.signals.terminated() => None,
        result = read_chunk(shared, &mut chunk) => Some(result?),
    };
    let Some(read) = read else {
        return Ok(false);
    };

    if read == 0 {
        debug!(device = %shared.settings.name, "Remote end closed the connection");
        shared.signals.remote_disconnected.set();
        return Ok(false);
    }
    dispatch(shared, &chunk[..read]);
    Ok(true)
}

async fn read_chunk(shared: &Shared, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut reader = shared.reader.lock().await;
    reader.read(buf).await
}

fn dispatch(shared: &Shared, data: &[u8]) {
    let mut protocol = shared.protocol.borrow_mut();
    let mut state = shared.state.borrow_mut();
    let mut link = shared.link.borrow_mut();
    trace!(device = %shared.settings.name, data = %data.escape_ascii(), "Received");

    link.received(Instant::now());
    link.inbuffer.extend_from_slice(data);
    let frames = protocol.cut_messages(&mut link.inbuffer);
    state.telemetry.record_receive(data.len(), frames.len());

    let mut clear = false;
    for frame in &frames {
        let sent = link.in_flight_message();
        if sent.is_none() {
            state.warning(format!(
                "Message received ({}) without a query.",
                frame.escape_ascii()
            ));
        }
        if let Err(e) = protocol.interpret_message(&mut state, frame, sent) {
            state.error(format!(
                "Cannot interpret message {}: {e}",
                frame.escape_ascii()
            ));
        }
        clear = link.consume_replies(1);
    }
    if clear {
        shared.signals.clear_to_send.set();
    }
    drop(link);
    run_deferred(&mut **protocol, &mut state);
}
