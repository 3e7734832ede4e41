//! loraham-link: TCP link to the node simulator and the event loop that
//! drives it.
//!
//! A [`LinkConnection`] frames the node's `\r\n`-terminated console output,
//! unwraps `pkt:` lines into packets and dispatches them to protocol
//! handlers. The [`EventLoop`] multiplexes any number of links with
//! one-shot timers on a single thread.
//!
//! # Architecture
//!
//! - [`protocol`] -- line tags, `pkt:` header decode, command encoders
//! - [`connection`] -- [`LinkConnection`], [`PacketReceiver`], [`LinkContext`]
//! - [`event_loop`] -- [`Scheduler`], [`EventLoop`], [`TimerHandle`]

pub mod connection;
pub mod event_loop;
pub mod protocol;

pub use connection::{
    LinkConfig, LinkConnection, LinkContext, LinkStats, PacketReceiver, SharedReceiver,
};
pub use event_loop::{EventLoop, LinkId, Scheduler, Task, TimerHandle};
pub use protocol::FramingError;
