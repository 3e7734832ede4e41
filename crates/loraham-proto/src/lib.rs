//! loraham-proto: transactional protocols run over a LoRaHam link.
//!
//! Each protocol keeps its pending transactions in a table that is
//! registered on a [`LinkConnection`](loraham_link::LinkConnection) as a
//! packet handler. Unanswered requests are resent on a fixed interval until
//! the peer replies.
//!
//! - [`switch`] -- challenge-response remote switch (`SW`)
//! - [`ping`] -- ping/echo liveness check (`PING` / `PONG`)

pub mod ping;
pub mod switch;

pub use ping::{PingClient, PingConfig, PingTable, PingTransaction};
pub use switch::{SwitchClient, SwitchConfig, SwitchState, SwitchTable, SwitchTransaction};

use loraham_core::error::{Error, Result};

/// Reject destinations that cannot appear in a packet preamble.
pub(crate) fn validate_peer(peer: &str) -> Result<()> {
    if peer.is_empty() {
        return Err(Error::InvalidParameter("peer callsign is empty".into()));
    }
    if let Some(c) = peer
        .chars()
        .find(|c| matches!(c, '<' | ':' | ',') || c.is_whitespace())
    {
        return Err(Error::InvalidParameter(format!(
            "peer callsign {peer:?} contains {c:?}"
        )));
    }
    Ok(())
}
