//! Mutable state of a backend, as seen by the protocol hooks.

use super::outbuffer::{OutboundBuffer, PendingMessage};
use super::registry::{VariableRegistry, AUX_STATUS_VARIABLE, STATUS_VARIABLE};
use super::signal::Signals;
use super::variable::{QueryTimeout, Variable, VariableInfo, VariableValue};
use crate::error::AppResult;
use crate::health::TelemetryFrame;
use crate::messages::{DeviceEvent, LogLevel};
use bytes::Bytes;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Initializing,
    /// Connected, some variables still without a value
    VariablesPending,
    Ready,
    Disconnecting,
    Terminated,
}

impl fmt::Display for BackendPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendPhase::Initializing => "initializing",
            BackendPhase::VariablesPending => "variables pending",
            BackendPhase::Ready => "ready",
            BackendPhase::Disconnecting => "disconnecting",
            BackendPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Progress of a panic requested by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicState {
    NoPanic,
    Panicking,
    Panicked,
}

/// Work requested by hooks, run by the engine once the hook has returned.
#[derive(Debug, Default)]
pub(crate) struct DeferredWork {
    pub queries: Vec<(String, bool)>,
    pub changes: Vec<(String, VariableValue, VariableValue)>,
    pub became_ready: bool,
}

impl DeferredWork {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.changes.is_empty() && !self.became_ready
    }
}

/// Variables, outbound queue and owner channel of one backend.
///
/// Every [`DeviceProtocol`](super::DeviceProtocol) hook receives a mutable
/// reference to this; it is how protocols enqueue messages, publish values
/// and talk to the owner.
pub struct DeviceState {
    name: String,
    registry: VariableRegistry,
    outbuffer: OutboundBuffer,
    signals: Rc<Signals>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    phase: BackendPhase,
    panic_state: PanicState,
    ready: bool,
    pub(crate) telemetry: TelemetryFrame,
    deferred: DeferredWork,
}

impl DeviceState {
    /// Builds the state for the declared variables. The outbound buffer
    /// capacity defaults to the number of variables.
    pub fn new(
        name: impl Into<String>,
        variables: Vec<VariableInfo>,
        outbuffer_capacity: Option<usize>,
        signals: Rc<Signals>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> AppResult<Self> {
        let registry = VariableRegistry::new(variables)?;
        let capacity = outbuffer_capacity.unwrap_or(registry.len());
        Ok(Self {
            name: name.into(),
            registry,
            outbuffer: OutboundBuffer::new(capacity),
            signals,
            events,
            phase: BackendPhase::Initializing,
            panic_state: PanicState::NoPanic,
            ready: false,
            telemetry: TelemetryFrame::start(Instant::now()),
            deferred: DeferredWork::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> BackendPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn panic_state(&self) -> PanicState {
        self.panic_state
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut VariableRegistry {
        &mut self.registry
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    pub(crate) fn set_phase(&mut self, phase: BackendPhase) {
        if self.phase != phase {
            debug!(device = %self.name, from = %self.phase, to = %phase, "Backend phase change");
            self.phase = phase;
        }
    }

    /// Sends an event to the owner. A vanished owner is not an error here;
    /// the bridge notices it on the inbound side.
    pub(crate) fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!(device = %self.name, "Owner event queue closed");
        }
    }

    // ---- outbound messages ----

    /// Queues a message for the hardware. The sender keeps the link closed
    /// until `expected_replies` frames have arrived.
    pub fn enqueue(&mut self, message: impl Into<Bytes>, expected_replies: usize) {
        self.enqueue_with_urgency(message, expected_replies, 0.0);
    }

    /// Like [`enqueue`](Self::enqueue), but the message is sent as if it had
    /// been queued `urgency_bias` seconds earlier.
    pub fn enqueue_with_urgency(
        &mut self,
        message: impl Into<Bytes>,
        expected_replies: usize,
        urgency_bias: f64,
    ) {
        let pending = PendingMessage {
            message: message.into(),
            expected_replies,
        };
        self.outbuffer.push(pending, urgency_bias, Instant::now());
        self.signals.outbound_pending.set();
    }

    pub fn outbuffer_len(&self) -> usize {
        self.outbuffer.len()
    }

    pub fn outbuffer_full(&self) -> bool {
        self.outbuffer.is_full()
    }

    pub(crate) fn next_outbound(&mut self) -> Option<PendingMessage> {
        let next = self.outbuffer.pop();
        if self.outbuffer.is_empty() {
            self.signals.outbound_pending.clear();
        }
        next
    }

    // ---- variables ----

    pub fn variable(&self, name: &str) -> AppResult<&Variable> {
        self.registry.get(name)
    }

    /// Current value, or `None` if the variable is unknown or was never updated.
    pub fn value(&self, name: &str) -> Option<&VariableValue> {
        self.registry
            .get(name)
            .ok()
            .filter(|v| v.has_value())
            .map(Variable::value)
    }

    /// Publishes a new value. Returns true if it differs from the previous one,
    /// in which case the owner gets a `variableChanged` event.
    pub fn update_variable(
        &mut self,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> AppResult<bool> {
        let value = value.into();
        let now = Instant::now();
        let variable = self.registry.get(name)?;
        let kind = variable.info().kind;
        if !kind.accepts(&value) {
            self.warning(format!(
                "Variable {name} is declared as {kind:?} but got {value:?}"
            ));
        }
        if let Some(queried) = self.registry.get(name)?.last_query() {
            self.telemetry
                .record_query_latency(now.saturating_duration_since(queried));
        }

        let changed = self.registry.update(name, value, now)?;
        if changed {
            let variable = self.registry.get(name)?;
            let (value, previous) = (variable.value().clone(), variable.previous_value().clone());
            self.emit(DeviceEvent::VariableChanged {
                name: name.to_string(),
                value: value.clone(),
                previous_value: previous.clone(),
            });
            self.deferred.changes.push((name.to_string(), value, previous));
        }
        self.check_ready()?;
        Ok(changed)
    }

    fn check_ready(&mut self) -> AppResult<()> {
        if self.ready || !self.registry.all_have_values() {
            return Ok(());
        }
        self.ready = true;
        if self.phase == BackendPhase::VariablesPending {
            self.set_phase(BackendPhase::Ready);
        }
        self.info("All variables ready.");
        self.emit(DeviceEvent::Ready);
        if self.value(STATUS_VARIABLE).and_then(VariableValue::as_str) == Some("initializing") {
            self.update_variable(STATUS_VARIABLE, "idle")?;
        }
        self.deferred.became_ready = true;
        Ok(())
    }

    /// Asks for a fresh value of `name`. The query is issued right after the
    /// current hook returns. With `force`, the answer is reported as a change
    /// even if the value is the same.
    pub fn refresh_variable(&mut self, name: &str, force: bool) -> AppResult<()> {
        self.registry.get(name)?;
        self.deferred.queries.push((name.to_string(), force));
        Ok(())
    }

    pub fn set_status(&mut self, status: impl Into<VariableValue>) -> AppResult<bool> {
        self.update_variable(STATUS_VARIABLE, status)
    }

    pub fn set_aux_status(&mut self, status: impl Into<VariableValue>) -> AppResult<bool> {
        self.update_variable(AUX_STATUS_VARIABLE, status)
    }

    /// Temporarily changes how often `name` is polled.
    pub fn set_query_timeout(&mut self, name: &str, timeout: Duration) -> AppResult<()> {
        self.registry.set_timeout(name, QueryTimeout::Every(timeout))?;
        self.signals.wake_auto_query.set();
        Ok(())
    }

    /// Restores the declared query timeout of `name`.
    pub fn reset_query_timeout(&mut self, name: &str) -> AppResult<()> {
        self.registry.reset_timeout(name)?;
        self.signals.wake_auto_query.set();
        Ok(())
    }

    pub(crate) fn take_deferred(&mut self) -> DeferredWork {
        std::mem::take(&mut self.deferred)
    }

    // ---- auto-query ----

    pub fn enable_auto_query(&mut self) {
        self.registry.clear_outstanding();
        self.signals.auto_query_enabled.set();
    }

    /// Stops periodic polling; outstanding queries are forgotten.
    pub fn disable_auto_query(&mut self) {
        self.signals.auto_query_enabled.clear();
        self.registry.clear_outstanding();
    }

    pub fn auto_query_enabled(&self) -> bool {
        self.signals.auto_query_enabled.is_set()
    }

    /// Makes the auto-querier check for due variables now.
    pub fn wake_auto_query(&self) {
        self.signals.wake_auto_query.set();
    }

    // ---- owner notifications ----

    pub fn command_finished(&self, command: &str, result: impl Into<String>) {
        self.emit(DeviceEvent::CommandFinished {
            commandname: command.to_string(),
            result: result.into(),
        });
    }

    pub fn command_error(&self, command: &str, message: impl Into<String>) {
        self.emit(DeviceEvent::CommandError {
            commandname: command.to_string(),
            errormessage: message.into(),
        });
    }

    /// Asks the owner to bring the instrument into a safe state.
    pub fn panic(&self, reason: impl Into<String>) {
        self.emit(DeviceEvent::Panic {
            reason: reason.into(),
        });
    }

    pub(crate) fn begin_panic(&mut self) {
        self.panic_state = PanicState::Panicking;
    }

    /// Reports that the panic procedure has completed.
    pub fn acknowledge_panic(&mut self) {
        self.panic_state = PanicState::Panicked;
        self.emit(DeviceEvent::PanicAcknowledged);
    }

    // ---- logging ----

    /// Logs locally and forwards the record to the owner.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(device = %self.name, "{message}"),
            LogLevel::Info => info!(device = %self.name, "{message}"),
            LogLevel::Warning => warn!(device = %self.name, "{message}"),
            LogLevel::Error => error!(device = %self.name, "{message}"),
        }
        self.emit(DeviceEvent::Log { level, message });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("panic_state", &self.panic_state)
            .field("variables", &self.registry.len())
            .field("outbuffer", &self.outbuffer.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::variable::VariableType;
    use tracing_test::traced_test;

    pub(crate) fn state_with(
        variables: Vec<VariableInfo>,
    ) -> (DeviceState, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = DeviceState::new("test", variables, None, Rc::new(Signals::new()), tx).unwrap();
        (state, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_change_event_only_on_change() {
        let (mut state, mut rx) = state_with(vec![VariableInfo::new("temp")]);
        assert!(state.update_variable("temp", 21.5).unwrap());
        assert!(!state.update_variable("temp", 21.5).unwrap());
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![DeviceEvent::VariableChanged {
                name: "temp".into(),
                value: VariableValue::Float(21.5),
                previous_value: VariableValue::Null,
            }]
        );
    }

    #[test]
    fn test_ready_fires_once_and_sets_idle() {
        let (mut state, mut rx) = state_with(vec![VariableInfo::new("a"), VariableInfo::new("b")]);
        state.set_status("initializing").unwrap();
        state.set_aux_status(VariableValue::Null).unwrap();
        state.set_phase(BackendPhase::VariablesPending);
        state.update_variable("a", 1).unwrap();
        assert!(!state.is_ready());
        state.update_variable("b", 2).unwrap();
        assert!(state.is_ready());
        assert_eq!(state.phase(), BackendPhase::Ready);
        assert_eq!(state.value(STATUS_VARIABLE), Some(&VariableValue::from("idle")));

        let events = drain(&mut rx);
        let ready_count = events.iter().filter(|e| **e == DeviceEvent::Ready).count();
        assert_eq!(ready_count, 1);
        assert!(state.take_deferred().became_ready);

        state.update_variable("b", 3).unwrap();
        assert!(!drain(&mut rx).contains(&DeviceEvent::Ready));
    }

    #[test]
    fn test_protocol_status_is_not_overwritten() {
        let (mut state, _rx) = state_with(vec![VariableInfo::new("a")]);
        state.set_status("initializing").unwrap();
        state.set_status("busy").unwrap();
        state.set_aux_status("warming up").unwrap();
        state.update_variable("a", true).unwrap();
        assert!(state.is_ready());
        assert_eq!(state.value(STATUS_VARIABLE), Some(&VariableValue::from("busy")));
    }

    #[test]
    fn test_enqueue_sets_pending_flag() {
        let (mut state, _rx) = state_with(vec![VariableInfo::new("a")]);
        assert!(!state.signals().outbound_pending.is_set());
        state.enqueue(&b"?A\r"[..], 1);
        assert!(state.signals().outbound_pending.is_set());
        // capacity defaults to the variable count, status variables included
        assert!(!state.outbuffer_full());
        assert_eq!(state.outbuffer_len(), 1);
        let msg = state.next_outbound().unwrap();
        assert_eq!(msg.message, Bytes::from_static(b"?A\r"));
        assert!(!state.signals().outbound_pending.is_set());
    }

    #[test]
    fn test_refresh_unknown_variable_fails() {
        let (mut state, _rx) = state_with(vec![VariableInfo::new("a")]);
        assert!(state.refresh_variable("nope", false).is_err());
        state.refresh_variable("a", true).unwrap();
        let work = state.take_deferred();
        assert_eq!(work.queries, vec![("a".to_string(), true)]);
        assert!(state.take_deferred().is_empty());
    }

    #[test]
    fn test_disable_auto_query_clears_outstanding() {
        let (mut state, _rx) = state_with(vec![VariableInfo::new("a")]);
        state
            .registry_mut()
            .begin_query("a", false, Instant::now())
            .unwrap();
        state.disable_auto_query();
        assert!(!state.auto_query_enabled());
        assert!(!state.variable("a").unwrap().query_outstanding());
        state.enable_auto_query();
        assert!(state.auto_query_enabled());
    }

    #[traced_test]
    #[test]
    fn test_type_mismatch_is_logged_not_rejected() {
        let (mut state, mut rx) = state_with(vec![
            VariableInfo::new("count").kind(VariableType::Int)
        ]);
        assert!(state.update_variable("count", "many").unwrap());
        assert!(logs_contain("declared as Int"));
        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            DeviceEvent::Log { level: LogLevel::Warning, .. }
        ));
    }

    #[traced_test]
    #[test]
    fn test_date_variable_rejects_full_timestamp() {
        let (mut state, _rx) = state_with(vec![
            VariableInfo::new("calibrated").kind(VariableType::Date)
        ]);
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        state.update_variable("calibrated", date).unwrap();
        assert!(!logs_contain("declared as Date"));
        state.update_variable("calibrated", chrono::Utc::now()).unwrap();
        assert!(logs_contain("declared as Date"));
    }

    #[test]
    fn test_panic_acknowledgement() {
        let (mut state, mut rx) = state_with(vec![]);
        state.begin_panic();
        assert_eq!(state.panic_state(), PanicState::Panicking);
        state.acknowledge_panic();
        assert_eq!(state.panic_state(), PanicState::Panicked);
        assert_eq!(drain(&mut rx), vec![DeviceEvent::PanicAcknowledged]);
    }
}
