//! loraham-core: packet codec, parameter types and error definitions.
//!
//! This crate holds the transport-agnostic pieces of the LoRaHam TNC
//! harness. The link crate frames bytes into packets using [`Packet::decode`];
//! protocol crates inspect the decoded [`Params`] to route replies.
//!
//! # Key types
//!
//! - [`Packet`] -- a decoded link packet (addresses, params, message)
//! - [`Params`] -- the symbol parameter set of a packet
//! - [`DecodeError`] / [`DecodeFailure`] -- codec failure causes
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod packet;
pub mod params;

pub use error::{Error, Result};
pub use packet::{DecodeError, DecodeFailure, MAX_IDENT, Packet};
pub use params::Params;
