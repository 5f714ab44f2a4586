//! Reply timeouts, retransmission and giving up on a silent device.

mod common;

use beamline_daq::config::BackendSettings;
use beamline_daq::device::{VariableInfo, VariableValue};
use beamline_daq::error::DaqError;
use beamline_daq::messages::DeviceEvent;
use common::{collect_until_end, log_messages, run_backend, spawn_device, test_settings, values_of, LineProtocol};
use std::time::Duration;

fn impatient(name: &str) -> BackendSettings {
    BackendSettings {
        message_reply_timeout: Duration::from_millis(100),
        message_max_retries: 2,
        ..test_settings(name)
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_gets_original_plus_retries() {
    let protocol = LineProtocol::new(vec![VariableInfo::new("x")]);
    let (device_io, backend_io) = tokio::io::duplex(1024);
    let device = spawn_device(device_io, None, |_| None);

    let (result, events) = run_backend(Box::new(protocol), impatient("silent"), backend_io, |mut handle| async move {
        collect_until_end(&mut handle, |_, _| {}).await
    })
    .await;

    match result {
        Err(DaqError::ReplyTimeout { retries, message }) => {
            assert_eq!(retries, 2);
            assert!(message.contains("?x"));
        }
        other => panic!("expected a reply timeout, got {other:?}"),
    }
    let received = device.await.unwrap();
    let lines: Vec<&str> = received.iter().map(|r| r.line.as_str()).collect();
    assert_eq!(lines, vec!["?x", "?x", "?x"]);
    for pair in received.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_millis(100));
    }

    let logs = log_messages(&events);
    assert_eq!(
        logs.iter().filter(|m| m.starts_with("Reply timeout, retrying")).count(),
        1,
        "only retries after the first one are reported"
    );
    assert!(logs.iter().any(|m| m.contains("retry 2 of 2")));
    assert_eq!(events.last(), Some(&DeviceEvent::End { expected: false }));
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_to_retransmission_is_accepted() {
    let protocol = LineProtocol::new(vec![VariableInfo::new("x").once()]);
    let (device_io, backend_io) = tokio::io::duplex(1024);
    let mut seen = 0;
    let device = spawn_device(device_io, None, move |_| {
        seen += 1;
        // ignore the first copy
        (seen == 2).then(|| "x=7\n".to_string())
    });

    let (result, events) = run_backend(Box::new(protocol), impatient("late"), backend_io, |mut handle| async move {
        collect_until_end(&mut handle, |handle, event| {
            if *event == DeviceEvent::Ready {
                handle.end();
            }
        })
        .await
    })
    .await;

    result.unwrap();
    assert_eq!(values_of(&events, "x"), vec![&VariableValue::Float(7.0)]);
    assert_eq!(events.last(), Some(&DeviceEvent::End { expected: true }));
    assert_eq!(device.await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_reply_is_tolerated() {
    let protocol = LineProtocol::new(vec![VariableInfo::new("x").once()]);
    let (device_io, backend_io) = tokio::io::duplex(1024);
    // answer twice: the second line arrives with nothing in flight
    let _device = spawn_device(device_io, None, |_| Some("x=1\nx=2\n".to_string()));

    let (result, events) = run_backend(Box::new(protocol), impatient("chatty"), backend_io, |mut handle| async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.end();
        collect_until_end(&mut handle, |_, _| {}).await
    })
    .await;

    result.unwrap();
    assert_eq!(
        values_of(&events, "x"),
        vec![&VariableValue::Float(1.0), &VariableValue::Float(2.0)]
    );
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.contains("without a query")));
    assert_eq!(events.last(), Some(&DeviceEvent::End { expected: true }));
}
