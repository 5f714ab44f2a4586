//! Custom error types for the device backend.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! backend engine, the protocol hooks and the configuration layer. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures a hardware link can produce.
//!
//! ## Error Hierarchy
//!
//! - **`Protocol`**: a frame could not be interpreted. Logged by the receiver,
//!   the link keeps running.
//! - **`UnknownVariable`**: a hook referred to a variable that was never declared.
//! - **`Command`**: the hardware rejected (or cannot perform) a requested action.
//!   Reported to the owner as a `commanderror` event, never fatal.
//! - **`ReplyTimeout`**: a message went unanswered after every allowed retry.
//! - **`LinkDead`**: telemetry found queries outstanding for too long.
//! - **`Connect`** / **`Io`**: socket failures.
//! - **`Config`** / **`Configuration`**: loading and validation problems.
//!
//! `ReplyTimeout`, `LinkDead`, `Connect` and `Io` are fatal: they end every
//! loop of the backend and terminate the worker. See [`DaqError::is_fatal`].

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Variable {0} does not exist")]
    UnknownVariable(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("Reached maximal number of send retries ({retries}) for message {message}")]
    ReplyTimeout { retries: u32, message: String },

    #[error("Outstanding query fail timeout reached. Variables not yet queried: {}", .0.join(", "))]
    LinkDead(Vec<String>),
}

impl DaqError {
    /// Whether this error must bring the whole backend down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Io(_)
                | DaqError::Connect { .. }
                | DaqError::ReplyTimeout { .. }
                | DaqError::LinkDead(_)
        )
    }
}
