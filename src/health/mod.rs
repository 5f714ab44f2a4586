//! Link health monitoring.
//!
//! Backends collect traffic counters, loop wake-ups and query latencies in a
//! [`TelemetryFrame`] and periodically publish them to their owner as a
//! [`TelemetrySnapshot`], together with the worker's memory footprint.

pub mod telemetry;

pub use telemetry::{ProcessSampler, TelemetryFrame, TelemetrySnapshot};
