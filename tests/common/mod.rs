//! Common test utilities for backend integration tests
//!
//! This module provides:
//! - A line-based test protocol (`?name` queries, `name=value;...` replies)
//! - A simulated device serving one end of an in-memory duplex stream
//! - Helpers to drive a backend and collect the events it emits

#![allow(dead_code)] // Not every test file uses every helper

use beamline_daq::config::BackendSettings;
use beamline_daq::device::{DeviceProtocol, DeviceState, VariableInfo, VariableValue};
use beamline_daq::error::{AppResult, DaqError};
use beamline_daq::messages::{frontend_channel, DeviceEvent, FrontendHandle};
use beamline_daq::DeviceBackend;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Settings suitable for tests: no connect flush, otherwise defaults.
pub fn test_settings(name: &str) -> BackendSettings {
    BackendSettings {
        connect_flush: Duration::ZERO,
        ..BackendSettings::for_device(name, "127.0.0.1", 1)
    }
}

/// Line protocol used against the simulated device.
///
/// Commands:
/// - `ping` finishes at once with result `pong`
/// - `hold` / `resume` switch auto-query off and on
/// - `refresh <name>` forces a query of a variable
pub struct LineProtocol {
    variables: Vec<VariableInfo>,
}

impl LineProtocol {
    pub fn new(variables: Vec<VariableInfo>) -> Self {
        Self { variables }
    }
}

impl DeviceProtocol for LineProtocol {
    fn variables(&self) -> Vec<VariableInfo> {
        self.variables.clone()
    }

    fn query(&mut self, device: &mut DeviceState, variable: &str) -> AppResult<()> {
        device.enqueue(format!("?{variable}\n"), 1);
        Ok(())
    }

    fn cut_messages(&mut self, buffer: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let frame = buffer.split_to(pos + 1).freeze();
            frames.push(frame.slice(..pos));
        }
        frames
    }

    fn interpret_message(
        &mut self,
        device: &mut DeviceState,
        frame: &[u8],
        _sent: Option<&[u8]>,
    ) -> AppResult<()> {
        let text = std::str::from_utf8(frame).map_err(|e| DaqError::Protocol(e.to_string()))?;
        for pair in text.split(';') {
            let (name, raw) = pair
                .split_once('=')
                .ok_or_else(|| DaqError::Protocol(format!("malformed reply {text}")))?;
            let value = raw
                .parse::<f64>()
                .map(VariableValue::Float)
                .unwrap_or_else(|_| VariableValue::from(raw));
            device.update_variable(name, value)?;
        }
        Ok(())
    }

    fn issue_command(
        &mut self,
        device: &mut DeviceState,
        name: &str,
        args: &[serde_json::Value],
    ) -> AppResult<()> {
        match name {
            "ping" => device.command_finished(name, "pong"),
            "hold" => {
                device.disable_auto_query();
                device.command_finished(name, "held");
            }
            "resume" => {
                device.enable_auto_query();
                device.command_finished(name, "resumed");
            }
            "refresh" => {
                let variable = args
                    .first()
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| DaqError::Command("refresh needs a variable name".into()))?;
                device.refresh_variable(variable, true)?;
                device.command_finished(name, variable);
            }
            other => return Err(DaqError::Command(format!("Unknown command {other}"))),
        }
        Ok(())
    }
}

/// A line received by the simulated device and when it arrived.
#[derive(Debug, Clone)]
pub struct Received {
    pub line: String,
    pub at: Instant,
}

/// Serves `stream` as a device: every received line is passed to `respond`,
/// whose answer (if any) is written back. Stops on EOF, or after `limit`
/// lines, closing the connection. Returns everything received.
pub fn spawn_device<F>(
    stream: DuplexStream,
    limit: Option<usize>,
    mut respond: F,
) -> JoinHandle<Vec<Received>>
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    tokio::spawn(async move {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut received = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = respond(&line);
            received.push(Received {
                line,
                at: Instant::now(),
            });
            if let Some(reply) = reply {
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            if limit.is_some_and(|limit| received.len() >= limit) {
                break;
            }
        }
        received
    })
}

/// Answers `?name` queries from a fixed table of replies.
pub fn table_responder(table: &'static [(&'static str, &'static str)]) -> impl FnMut(&str) -> Option<String> + Send + 'static {
    move |line| {
        let name = line.strip_prefix('?')?;
        table
            .iter()
            .find(|(query, _)| *query == name)
            .map(|(_, reply)| format!("{reply}\n"))
    }
}

/// Runs `backend` over `stream` while `owner` drives the frontend handle.
/// Returns the backend's result and whatever the owner returned.
pub async fn run_backend<O, Fut, T>(
    protocol: Box<dyn DeviceProtocol>,
    settings: BackendSettings,
    stream: DuplexStream,
    owner: O,
) -> (AppResult<()>, T)
where
    O: FnOnce(FrontendHandle) -> Fut,
    Fut: Future<Output = T>,
{
    let (handle, endpoint) = frontend_channel();
    let backend = DeviceBackend::new(protocol, settings, endpoint).expect("valid backend");
    tokio::join!(backend.run_with_stream(stream), owner(handle))
}

/// Collects events until `end`, calling `on_event` for each; `on_event` may
/// issue further commands.
pub async fn collect_until_end<F>(handle: &mut FrontendHandle, mut on_event: F) -> Vec<DeviceEvent>
where
    F: FnMut(&FrontendHandle, &DeviceEvent),
{
    let mut events = Vec::new();
    while let Some(event) = handle.recv().await {
        on_event(handle, &event);
        let done = matches!(event, DeviceEvent::End { .. });
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Log messages among `events` at any level.
pub fn log_messages(events: &[DeviceEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            DeviceEvent::Log { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

/// Values published for `name`, in order.
pub fn values_of<'a>(events: &'a [DeviceEvent], name: &str) -> Vec<&'a VariableValue> {
    events
        .iter()
        .filter_map(|event| match event {
            DeviceEvent::VariableChanged { name: n, value, .. } if n == name => Some(value),
            _ => None,
        })
        .collect()
}
