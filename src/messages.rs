//! Message types exchanged between a device backend and its owner.
//!
//! The backend runs in its own worker and talks to the owning process through
//! exactly two single-producer/single-consumer queues: [`FrontendCommand`]s
//! flow in, [`DeviceEvent`]s flow out. Both are plain values (serde
//! serialisable, tagged by a `command` field) so the same types can cross a
//! process boundary as JSON lines, see the `beamline-worker` binary.

use crate::device::VariableValue;
use crate::health::TelemetrySnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Instructions from the owner to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum FrontendCommand {
    /// Perform a device-specific action
    IssueCommand {
        name: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    /// Enter the panic state (see [`crate::device::DeviceProtocol::do_panic`])
    Panic,
    /// Stop the backend
    End,
}

impl FrontendCommand {
    /// Helper to create an `IssueCommand` message
    pub fn issue(name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self::IssueCommand {
            name: name.into(),
            args,
        }
    }
}

/// Severity of a log record forwarded to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Notifications from the backend to the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum DeviceEvent {
    /// First message of every backend: declared variables and their timeouts
    /// in seconds (`None` for variables that are queried at most once)
    #[serde(rename = "variablenames")]
    VariableNames { names: Vec<(String, Option<f64>)> },

    #[serde(rename = "variableChanged", rename_all = "camelCase")]
    VariableChanged {
        name: String,
        value: VariableValue,
        previous_value: VariableValue,
    },

    /// Every variable has received a value
    #[serde(rename = "ready")]
    Ready,

    #[serde(rename = "telemetry")]
    Telemetry { telemetry: Box<TelemetrySnapshot> },

    #[serde(rename = "log")]
    Log { level: LogLevel, message: String },

    #[serde(rename = "commandfinished")]
    CommandFinished { commandname: String, result: String },

    #[serde(rename = "commanderror")]
    CommandError {
        commandname: String,
        errormessage: String,
    },

    /// The device asks the owner to enter a panic state
    #[serde(rename = "panic")]
    Panic { reason: String },

    #[serde(rename = "panicacknowledged")]
    PanicAcknowledged,

    /// Last message of every backend
    #[serde(rename = "end")]
    End { expected: bool },
}

/// Owner-side ends of the two queues.
#[derive(Debug)]
pub struct FrontendHandle {
    commands: mpsc::UnboundedSender<FrontendCommand>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// Backend-side ends of the two queues.
#[derive(Debug)]
pub struct BackendEndpoint {
    pub(crate) commands: mpsc::UnboundedReceiver<FrontendCommand>,
    pub(crate) events: mpsc::UnboundedSender<DeviceEvent>,
}

/// Creates the command and event queues of one backend.
pub fn frontend_channel() -> (FrontendHandle, BackendEndpoint) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        FrontendHandle {
            commands: command_tx,
            events: event_rx,
        },
        BackendEndpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}

impl FrontendHandle {
    /// Queues a command; returns false if the backend is gone.
    pub fn send(&self, command: FrontendCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Asks the backend to perform a device-specific action.
    pub fn issue_command(&self, name: impl Into<String>, args: Vec<serde_json::Value>) -> bool {
        self.send(FrontendCommand::issue(name, args))
    }

    /// Asks the backend to stop.
    pub fn end(&self) -> bool {
        self.send(FrontendCommand::End)
    }

    /// Waits for the next event; `None` once the backend dropped its sender.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.events.recv().await
    }

    /// Returns an event if one is already queued.
    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.events.try_recv().ok()
    }

    /// Splits the handle into its raw channel ends.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<FrontendCommand>,
        mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        (self.commands, self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_wire_format() {
        let cmd: FrontendCommand =
            serde_json::from_value(json!({"command": "issuecommand", "name": "shutter", "args": [true]}))
                .unwrap();
        assert_eq!(cmd, FrontendCommand::issue("shutter", vec![json!(true)]));

        let end: FrontendCommand = serde_json::from_str(r#"{"command":"end"}"#).unwrap();
        assert_eq!(end, FrontendCommand::End);
    }

    #[test]
    fn test_variable_changed_uses_camel_case() {
        let event = DeviceEvent::VariableChanged {
            name: "pressure".into(),
            value: VariableValue::Float(1e-3),
            previous_value: VariableValue::Null,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["command"], "variableChanged");
        assert_eq!(value["name"], "pressure");
        assert!(value.get("previousValue").is_some());
    }

    #[test]
    fn test_end_and_command_error_shapes() {
        let end = serde_json::to_value(DeviceEvent::End { expected: false }).unwrap();
        assert_eq!(end, json!({"command": "end", "expected": false}));

        let err = serde_json::to_value(DeviceEvent::CommandError {
            commandname: "xray_on".into(),
            errormessage: "interlock open".into(),
        })
        .unwrap();
        assert_eq!(err["command"], "commanderror");
        assert_eq!(err["errormessage"], "interlock open");
    }

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (mut handle, mut endpoint) = frontend_channel();
        assert!(handle.end());
        assert_eq!(endpoint.commands.recv().await, Some(FrontendCommand::End));

        endpoint.events.send(DeviceEvent::Ready).unwrap();
        assert_eq!(handle.recv().await, Some(DeviceEvent::Ready));
        assert!(handle.try_recv().is_none());
    }
}
