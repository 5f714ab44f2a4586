//! Core library of the beamline device workers.
//!
//! Every hardware unit of the beamline (X-ray source, detector, motor
//! controllers, vacuum gauge, ...) is driven by its own worker running a
//! [`device::DeviceBackend`]. The backend keeps a TCP link to the device,
//! polls its state variables and forwards changes to the owning process
//! through the queues defined in [`messages`].
//!
//! - [`device`]: the generic backend engine and the [`device::DeviceProtocol`] trait
//! - [`instrument`]: concrete device protocols
//! - [`config`]: layered worker configuration
//! - [`health`]: telemetry of the hardware link
//! - [`error`] / [`error_recovery`]: error type and retry policy

pub mod config;
pub mod device;
pub mod error;
pub mod error_recovery;
pub mod health;
pub mod instrument;
pub mod messages;

pub use device::{spawn_worker, DeviceBackend, DeviceProtocol, DeviceState};
pub use error::{AppResult, DaqError};
pub use messages::{frontend_channel, DeviceEvent, FrontendCommand, FrontendHandle};
