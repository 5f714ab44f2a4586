//! Dispatch of commands arriving from the owner.

use super::protocol::run_deferred;
use super::state::PanicState;
use super::Shared;
use crate::error::{AppResult, DaqError};
use crate::messages::FrontendCommand;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::sleep;
use tracing::{info, warn};

/// Drains the inbound queue, then sleeps for the poll interval.
pub(crate) async fn run(shared: &Shared) -> AppResult<bool> {
    loop {
        let next = shared.inbound.borrow_mut().try_recv();
        match next {
            Ok(command) => {
                if !handle(shared, command) {
                    return Ok(false);
                }
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                warn!(device = %shared.settings.name, "Owner went away, stopping");
                shared.signals.stop.set();
                return Ok(false);
            }
        }
    }

    tokio::select! {
        _ = shared.signals.terminated() => Ok(false),
        _ = sleep(shared.settings.frontend_poll_interval) => Ok(true),
    }
}

/// Returns false if the backend has to stop.
fn handle(shared: &Shared, command: FrontendCommand) -> bool {
    let mut protocol = shared.protocol.borrow_mut();
    let mut state = shared.state.borrow_mut();
    match command {
        FrontendCommand::IssueCommand { name, args } => {
            if state.panic_state() != PanicState::NoPanic {
                state.command_error(&name, "Cannot issue command due to panic state.");
                return true;
            }
            if let Err(e) = protocol.issue_command(&mut state, &name, &args) {
                let message = match e {
                    DaqError::Command(message) => message,
                    other => other.to_string(),
                };
                state.command_error(&name, message);
            }
            run_deferred(&mut **protocol, &mut state);
            true
        }
        FrontendCommand::Panic => {
            warn!(device = %shared.settings.name, "Panic requested");
            state.begin_panic();
            protocol.do_panic(&mut state);
            run_deferred(&mut **protocol, &mut state);
            true
        }
        FrontendCommand::End => {
            info!(device = %shared.settings.name, "Stop requested");
            shared.signals.stop.set();
            false
        }
    }
}
