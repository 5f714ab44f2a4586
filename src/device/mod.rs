//! Generic asynchronous backend of one hardware device.
//!
//! A [`DeviceBackend`] owns the TCP connection to one instrument and keeps a
//! set of named variables up to date by polling it. The device-specific
//! encoding lives behind [`DeviceProtocol`]; everything else is shared:
//!
//! - **bridge**: executes commands from the owner
//! - **sender**: writes queued messages, one request/reply exchange at a time,
//!   re-sending unanswered ones
//! - **receiver**: frames incoming data and hands replies to the protocol
//! - **auto-querier**: queries variables whose values are overdue
//! - **telemetry**: reports link statistics and detects a stuck link
//!
//! The loops run cooperatively on a single thread (current-thread Tokio
//! runtime) and share state through `RefCell`s that are never held across an
//! await point.
//!
//! # Example
//!
//! ```no_run
//! use beamline_daq::config::BackendSettings;
//! use beamline_daq::device::spawn_worker;
//! use beamline_daq::instrument::tpg201::Tpg201;
//!
//! # async fn demo() -> beamline_daq::error::AppResult<()> {
//! let settings = BackendSettings::for_device("vacuum", "192.168.1.20", 2002);
//! let (mut handle, worker) = spawn_worker(|| Box::new(Tpg201::default()), settings)?;
//! while let Some(event) = handle.recv().await {
//!     println!("{event:?}");
//! }
//! # let _ = worker.join();
//! # Ok(())
//! # }
//! ```

mod autoquery;
mod bridge;
mod link;
mod outbuffer;
mod protocol;
mod receiver;
mod registry;
mod sender;
mod signal;
mod state;
mod supervisor;
mod variable;
mod watchdog;

pub use autoquery::issue_due_queries;
pub use outbuffer::{OutboundBuffer, PendingMessage};
pub use protocol::{query_variable, DeviceProtocol};
pub use registry::{VariableRegistry, AUX_STATUS_VARIABLE, STATUS_VARIABLE};
pub use signal::{Flag, Signals};
pub use state::{BackendPhase, DeviceState, PanicState};
pub use variable::{QueryTimeout, Variable, VariableInfo, VariableType, VariableValue};

use crate::config::BackendSettings;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::health::{ProcessSampler, TelemetryFrame};
use crate::messages::{
    frontend_channel, BackendEndpoint, DeviceEvent, FrontendCommand, FrontendHandle, LogLevel,
};
use link::LinkState;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::thread::JoinHandle;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{info, warn};

type Reader = Box<dyn AsyncRead + Unpin>;
type Writer = Box<dyn AsyncWrite + Unpin>;

/// State shared by the loops of a running backend.
pub(crate) struct Shared {
    pub settings: BackendSettings,
    pub policy: RetryPolicy,
    pub signals: Rc<Signals>,
    pub state: RefCell<DeviceState>,
    pub protocol: RefCell<Box<dyn DeviceProtocol>>,
    pub link: RefCell<LinkState>,
    pub inbound: RefCell<mpsc::UnboundedReceiver<FrontendCommand>>,
    pub sampler: RefCell<ProcessSampler>,
    // Only the receiver reads and only the sender (then shutdown) writes.
    pub reader: Mutex<Reader>,
    pub writer: Mutex<Writer>,
}

/// One device backend, ready to connect.
pub struct DeviceBackend {
    settings: BackendSettings,
    protocol: Box<dyn DeviceProtocol>,
    state: DeviceState,
    signals: Rc<Signals>,
    inbound: mpsc::UnboundedReceiver<FrontendCommand>,
}

impl DeviceBackend {
    /// Builds a backend talking to its owner through `endpoint`.
    pub fn new(
        protocol: Box<dyn DeviceProtocol>,
        settings: BackendSettings,
        endpoint: BackendEndpoint,
    ) -> AppResult<Self> {
        settings.validate()?;
        let signals = Rc::new(Signals::new());
        let state = DeviceState::new(
            settings.name.clone(),
            protocol.variables(),
            settings.outbuffer_capacity,
            Rc::clone(&signals),
            endpoint.events,
        )?;
        Ok(Self {
            settings,
            protocol,
            state,
            signals,
            inbound: endpoint.commands,
        })
    }

    /// Connects to `host:port` from the settings and serves until stopped,
    /// disconnected or failed.
    ///
    /// The owner always receives a final `end` event.
    pub async fn run(mut self) -> AppResult<()> {
        self.announce()?;
        let host = self.settings.host.clone();
        let port = self.settings.port;
        info!(device = %self.settings.name, %host, port, "Connecting");

        let connected = match timeout(
            self.settings.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out")),
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(source) => {
                self.state
                    .error(format!("Connection error to device: {source}"));
                self.state.emit(DeviceEvent::End { expected: false });
                self.state.set_phase(BackendPhase::Terminated);
                return Err(DaqError::Connect { host, port, source });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(device = %self.settings.name, error = %e, "Cannot disable Nagle's algorithm");
        }
        let (reader, writer) = stream.into_split();
        self.serve(Box::new(reader), Box::new(writer)).await
    }

    /// Serves over an already established byte stream.
    pub async fn run_with_stream<S>(mut self, stream: S) -> AppResult<()>
    where
        S: AsyncRead + AsyncWrite + 'static,
    {
        self.announce()?;
        let (reader, writer) = tokio::io::split(stream);
        self.serve(Box::new(reader), Box::new(writer)).await
    }

    /// Tells the owner which variables exist and marks the device as initializing.
    fn announce(&mut self) -> AppResult<()> {
        let names = self.state.variables().names_and_timeouts();
        self.state.emit(DeviceEvent::VariableNames { names });
        self.state.set_status("initializing")?;
        self.state.set_aux_status(VariableValue::Null)?;
        Ok(())
    }

    async fn serve(self, reader: Reader, writer: Writer) -> AppResult<()> {
        let DeviceBackend {
            settings,
            protocol,
            state,
            signals,
            inbound,
        } = self;

        let shared = Rc::new(Shared {
            policy: settings.retry_policy(),
            settings,
            signals,
            state: RefCell::new(state),
            protocol: RefCell::new(protocol),
            link: RefCell::new(LinkState::default()),
            inbound: RefCell::new(inbound),
            sampler: RefCell::new(ProcessSampler::new()),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        });

        let outcome = match flush_input(&shared).await {
            Ok(()) => {
                start_serving(&shared);
                supervisor::supervise(Rc::clone(&shared)).await
            }
            Err(e) => {
                shared
                    .state
                    .borrow()
                    .error(format!("Cannot flush input after connecting: {e}"));
                Err(e)
            }
        };
        shutdown(&shared).await;
        outcome
    }
}

/// Enters the pending (or ready) phase with a fresh telemetry frame.
fn start_serving(shared: &Shared) {
    let mut state = shared.state.borrow_mut();
    let phase = if state.is_ready() {
        BackendPhase::Ready
    } else {
        BackendPhase::VariablesPending
    };
    state.set_phase(phase);
    state.telemetry = TelemetryFrame::start(Instant::now());
}

/// Discards whatever the device sends within `connect_flush` of connecting.
async fn flush_input(shared: &Shared) -> AppResult<()> {
    let settings = &shared.settings;
    if settings.connect_flush.is_zero() {
        return Ok(());
    }
    let deadline = Instant::now() + settings.connect_flush;
    let mut buf = vec![0u8; settings.read_chunk_size];
    let mut flushed = 0;
    let mut reader = shared.reader.lock().await;
    // EOF is left for the receiver to notice
    while let Ok(read) = timeout_at(deadline, reader.read(&mut buf)).await {
        match read? {
            0 => break,
            n => flushed += n,
        }
    }
    if flushed > 0 {
        shared
            .state
            .borrow()
            .debug(format!("Flushed input queue: {flushed} bytes."));
    }
    Ok(())
}

async fn shutdown(shared: &Shared) {
    shared
        .state
        .borrow_mut()
        .set_phase(BackendPhase::Disconnecting);

    let closed = shared.writer.lock().await.shutdown().await;
    if let Err(e) = closed {
        let state = shared.state.borrow();
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected => {
                state.warning("Remote disconnected while closing the connection.");
            }
            _ => state.error(format!("Error while closing the connection: {e}")),
        }
    }

    let expected = shared.signals.stop.is_set();
    let mut state = shared.state.borrow_mut();
    state.emit(DeviceEvent::End { expected });
    state.set_phase(BackendPhase::Terminated);
    info!(device = %shared.settings.name, expected, "Backend terminated");
}

/// Runs a backend on a dedicated thread with its own current-thread runtime.
///
/// The protocol is built on that thread by `factory`. Returns the owner-side
/// queues and the thread handle, whose result is the backend's outcome.
pub fn spawn_worker<F>(
    factory: F,
    settings: BackendSettings,
) -> AppResult<(FrontendHandle, JoinHandle<AppResult<()>>)>
where
    F: FnOnce() -> Box<dyn DeviceProtocol> + Send + 'static,
{
    settings.validate()?;
    let (handle, endpoint) = frontend_channel();
    let thread = std::thread::Builder::new()
        .name(format!("backend-{}", settings.name))
        .spawn(move || {
            let events = endpoint.events.clone();
            let started = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(DaqError::from)
                .and_then(|runtime| Ok((runtime, DeviceBackend::new(factory(), settings, endpoint)?)));
            match started {
                Ok((runtime, backend)) => runtime.block_on(backend.run()),
                Err(e) => {
                    // the endpoint never reached a backend, so end the stream here
                    let _ = events.send(DeviceEvent::Log {
                        level: LogLevel::Error,
                        message: format!("Cannot start backend: {e}"),
                    });
                    let _ = events.send(DeviceEvent::End { expected: false });
                    Err(e)
                }
            }
        })?;
    Ok((handle, thread))
}
