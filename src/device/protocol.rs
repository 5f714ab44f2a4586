//! The device-specific half of a backend.

use super::state::DeviceState;
use super::variable::{VariableInfo, VariableValue};
use crate::error::AppResult;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

/// Encoding and decoding of one kind of hardware.
///
/// The engine owns the socket, the timers and the variable bookkeeping; a
/// protocol only translates between variables/commands and bytes. All hooks
/// are synchronous and run on the backend's single thread, so they must not
/// block.
///
/// # Message Flow
///
/// ```text
/// query()/issue_command() → DeviceState::enqueue() → sender → socket
/// socket → receiver → cut_messages() → interpret_message() → DeviceState::update_variable()
/// ```
pub trait DeviceProtocol {
    /// Static variable declarations.
    ///
    /// Called once when the backend is built. `__status__` and
    /// `__auxstatus__` are added by the engine and must not be declared.
    fn variables(&self) -> Vec<VariableInfo>;

    /// Enqueue the message(s) that make the hardware report `variable`.
    ///
    /// Only called for variables with an empty `depends_from` list or for
    /// the sources named in such lists.
    fn query(&mut self, device: &mut DeviceState, variable: &str) -> AppResult<()>;

    /// Split complete frames off the front of `buffer`.
    ///
    /// Incomplete trailing data must be left in the buffer; it is kept for
    /// the next read.
    fn cut_messages(&mut self, buffer: &mut BytesMut) -> Vec<Bytes>;

    /// Decode one frame. `sent` is the message awaiting replies, if any.
    ///
    /// Errors are logged and the frame is dropped; they never stop the link.
    fn interpret_message(
        &mut self,
        device: &mut DeviceState,
        frame: &[u8],
        sent: Option<&[u8]>,
    ) -> AppResult<()>;

    /// Perform a device-specific action requested by the owner.
    ///
    /// The outcome is reported through [`DeviceState::command_finished`] or
    /// [`DeviceState::command_error`], now or once the hardware confirms. A
    /// returned error is reported as a `commanderror`.
    fn issue_command(
        &mut self,
        device: &mut DeviceState,
        name: &str,
        args: &[serde_json::Value],
    ) -> AppResult<()>;

    /// Called once, when every variable has received its first value.
    fn on_variables_ready(&mut self, _device: &mut DeviceState) {}

    /// Called after a variable changed its value.
    fn on_variable_changed(
        &mut self,
        _device: &mut DeviceState,
        _name: &str,
        _value: &VariableValue,
        _previous: &VariableValue,
    ) {
    }

    /// Bring the hardware into a safe state after the owner requested a panic.
    ///
    /// Must eventually call [`DeviceState::acknowledge_panic`]. The default
    /// acknowledges at once.
    fn do_panic(&mut self, device: &mut DeviceState) {
        device.acknowledge_panic();
    }
}

/// Issues the wire queries needed to refresh `name`.
///
/// Sources already awaiting a reply are not queried again.
pub fn query_variable(
    protocol: &mut dyn DeviceProtocol,
    device: &mut DeviceState,
    name: &str,
    force: bool,
) -> AppResult<()> {
    let sources = device
        .registry_mut()
        .begin_query(name, force, Instant::now())?;
    for source in sources {
        protocol.query(device, &source)?;
    }
    Ok(())
}

/// Runs the work hooks requested while they executed: change callbacks,
/// queries and the readiness callback.
pub(crate) fn run_deferred(protocol: &mut dyn DeviceProtocol, device: &mut DeviceState) {
    loop {
        let work = device.take_deferred();
        if work.is_empty() {
            break;
        }
        for (name, value, previous) in &work.changes {
            protocol.on_variable_changed(device, name, value, previous);
        }
        for (name, force) in &work.queries {
            if let Err(e) = query_variable(protocol, device, name, *force) {
                device.error(format!("Cannot query variable {name}: {e}"));
            }
        }
        if work.became_ready {
            protocol.on_variables_ready(device);
        }
    }
}
