//! Error types for the LoRaHam harness.
//!
//! All fallible operations across the workspace return [`Result<T>`], which
//! uses [`Error`] as the error type. Packet decode causes have their own
//! type, [`DecodeError`](crate::packet::DecodeError), returned together with
//! the partial packet.

/// The error type for all harness operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (TCP socket to the node simulator).
    #[error("transport error: {0}")]
    Transport(String),

    /// Timed out connecting to, or waiting on, the node.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed to a harness operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A timer handle was cancelled that was never scheduled or has
    /// already fired.
    #[error("unknown timer handle {0}")]
    UnknownTimer(u64),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
