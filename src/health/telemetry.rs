//! Per-period link statistics of a device backend.
//!
//! A [`TelemetryFrame`] accumulates counters while the backend runs; the
//! telemetry loop periodically turns it into an immutable
//! [`TelemetrySnapshot`], sends it to the owner and starts a new frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::time::Instant;

/// Counters collected during one telemetry period.
#[derive(Debug)]
pub struct TelemetryFrame {
    started: Instant,
    started_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub loop_wakes: BTreeMap<String, u64>,
    query_latencies: Vec<Duration>,
}

impl TelemetryFrame {
    pub fn start(now: Instant) -> Self {
        Self {
            started: now,
            started_at: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            loop_wakes: BTreeMap::new(),
            query_latencies: Vec::new(),
        }
    }

    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
    }

    pub fn record_receive(&mut self, bytes: usize, messages: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += messages as u64;
    }

    pub fn record_wake(&mut self, loop_name: &str) {
        *self.loop_wakes.entry(loop_name.to_string()).or_default() += 1;
    }

    /// Time between issuing a query and the variable being updated.
    pub fn record_query_latency(&mut self, latency: Duration) {
        self.query_latencies.push(latency);
    }

    /// Closes the frame. Fields describing the link are left at their defaults
    /// for the caller to fill in.
    pub fn finish(self, now: Instant) -> TelemetrySnapshot {
        let count = self.query_latencies.len();
        let (mean, max) = if count == 0 {
            (None, None)
        } else {
            let total: f64 = self.query_latencies.iter().map(Duration::as_secs_f64).sum();
            let max = self
                .query_latencies
                .iter()
                .max()
                .map(Duration::as_secs_f64);
            (Some(total / count as f64), max)
        };
        TelemetrySnapshot {
            start: self.started_at,
            duration_secs: now.saturating_duration_since(self.started).as_secs_f64(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            loop_wakes: self.loop_wakes,
            query_count: count,
            query_latency_mean: mean,
            query_latency_max: max,
            ..TelemetrySnapshot::default()
        }
    }
}

/// Link health report sent to the owner once per telemetry period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub start: DateTime<Utc>,
    pub duration_secs: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// How many times each backend loop completed
    pub loop_wakes: BTreeMap<String, u64>,
    /// Variables without a value
    pub missing_variables: Vec<String>,
    /// Queries unanswered for longer than the telemetry period, with their age
    pub outdated_queries: BTreeMap<String, f64>,
    /// Variables past their query timeout, with the overdue time
    pub overdue_variables: BTreeMap<String, f64>,
    pub query_count: usize,
    pub query_latency_mean: Option<f64>,
    pub query_latency_max: Option<f64>,
    pub outbuffer_length: usize,
    pub autoquery_inhibited: bool,
    pub clear_to_send: bool,
    pub socket_eof: bool,
    /// Message awaiting replies, if any
    pub last_message: Option<String>,
    pub last_send_age: Option<f64>,
    pub last_recv_age: Option<f64>,
    pub process_id: Option<u32>,
    /// Resident memory of the worker process in bytes
    pub memory_bytes: Option<u64>,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Telemetry information")?;
        writeln!(f, "   start time: {}", self.start.to_rfc3339())?;
        writeln!(f, "   duration: {:.3} seconds", self.duration_secs)?;
        if let Some(mem) = self.memory_bytes {
            writeln!(f, "   memory usage: {:.4} GB", mem as f64 / f64::from(1u32 << 30))?;
        }
        writeln!(f, "   bytes sent: {}", self.bytes_sent)?;
        writeln!(f, "   bytes received: {}", self.bytes_received)?;
        writeln!(f, "   messages sent: {}", self.messages_sent)?;
        writeln!(f, "   messages received: {}", self.messages_received)?;
        writeln!(f, "   clear to send: {}", self.clear_to_send)?;
        writeln!(f, "   last message: {:?}", self.last_message)?;
        writeln!(f, "   socket EOF: {}", self.socket_eof)?;
        writeln!(f, "   autoquery inhibited: {}", self.autoquery_inhibited)?;
        writeln!(f, "   missing variables: {:?}", self.missing_variables)?;
        writeln!(f, "   output buffer length: {}", self.outbuffer_length)?;
        if let (Some(mean), Some(max)) = (self.query_latency_mean, self.query_latency_max) {
            writeln!(
                f,
                "   query latency: {} queries, mean {mean:.3} s, max {max:.3} s",
                self.query_count
            )?;
        }
        writeln!(f, "   loop wakes:")?;
        for (name, count) in &self.loop_wakes {
            writeln!(f, "      {name}: {count}")?;
        }
        writeln!(f, "   outdated queries:")?;
        for (name, age) in &self.outdated_queries {
            writeln!(f, "      {name}: {age:.3}")?;
        }
        write!(f, "   overdue variables: {}", self.overdue_variables.len())
    }
}

/// Reads the memory footprint of the current process.
pub struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Process id and resident memory in bytes.
    pub fn sample(&mut self) -> (Option<u32>, Option<u64>) {
        let Some(pid) = self.pid else {
            return (None, None);
        };
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let memory = self.system.process(pid).map(|process| process.memory());
        (Some(pid.as_u32()), memory)
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcessSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSampler").field("pid", &self.pid).finish()
    }
}
