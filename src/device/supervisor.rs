//! Runs the backend loops side by side on one thread.

use super::{autoquery, bridge, receiver, sender, watchdog, Shared};
use crate::error::AppResult;
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::rc::Rc;
use tracing::debug;

/// The concurrently running loops of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopKind {
    Bridge,
    Sender,
    Receiver,
    AutoQuerier,
    Telemetry,
}

impl LoopKind {
    pub const ALL: [LoopKind; 5] = [
        LoopKind::Bridge,
        LoopKind::Sender,
        LoopKind::Receiver,
        LoopKind::AutoQuerier,
        LoopKind::Telemetry,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LoopKind::Bridge => "bridge",
            LoopKind::Sender => "sender",
            LoopKind::Receiver => "receiver",
            LoopKind::AutoQuerier => "autoquerier",
            LoopKind::Telemetry => "telemetry",
        }
    }

    /// One cycle of the loop; `Ok(true)` asks to be run again.
    fn start(self, shared: Rc<Shared>) -> LocalBoxFuture<'static, (LoopKind, AppResult<bool>)> {
        async move {
            let result = match self {
                LoopKind::Bridge => bridge::run(&shared).await,
                LoopKind::Sender => sender::run(&shared).await,
                LoopKind::Receiver => receiver::run(&shared).await,
                LoopKind::AutoQuerier => autoquery::run(&shared).await,
                LoopKind::Telemetry => watchdog::run(&shared).await,
            };
            (self, result)
        }
        .boxed_local()
    }
}

/// Runs until every loop has finished or one of them failed.
///
/// Finished cycles are rescheduled unless stop was requested. The first error
/// drops (and thereby cancels) the remaining loops and is returned.
pub(crate) async fn supervise(shared: Rc<Shared>) -> AppResult<()> {
    let mut running: FuturesUnordered<_> = LoopKind::ALL
        .iter()
        .map(|kind| kind.start(Rc::clone(&shared)))
        .collect();

    while let Some((kind, result)) = running.next().await {
        shared.state.borrow_mut().telemetry.record_wake(kind.name());
        match result {
            Ok(true) if !shared.signals.stop.is_set() => {
                running.push(kind.start(Rc::clone(&shared)));
            }
            Ok(_) => {
                debug!(device = %shared.settings.name, task = kind.name(), "Loop finished");
            }
            Err(e) => {
                shared
                    .state
                    .borrow()
                    .error(format!("Exception occurred in the {} loop: {e}", kind.name()));
                return Err(e);
            }
        }
    }
    Ok(())
}
