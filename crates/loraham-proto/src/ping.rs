//! Ping/echo liveness protocol.
//!
//! The harness sends `PING <payload>` to a peer and retries every
//! [`PingConfig::retry_interval`] until a packet tagged `PONG` comes back
//! from that peer. One transaction is kept per destination callsign; pinging
//! a destination that already has one replaces it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use loraham_core::error::{Error, Result};
use loraham_core::packet::Packet;
use loraham_link::{LinkConnection, LinkContext, PacketReceiver, SharedReceiver, TimerHandle};

use crate::validate_peer;

/// Parameter key that marks ping replies.
pub const PING_TAG: &str = "PONG";

/// Completion callback, given the reply's message.
pub type PingCallback = Box<dyn FnOnce(Vec<u8>)>;

/// Ping protocol settings.
#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Delay before an unanswered ping is resent.
    pub retry_interval: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// One outstanding ping.
pub struct PingTransaction {
    peer: String,
    payload: Vec<u8>,
    timer: Option<TimerHandle>,
    callback: Option<PingCallback>,
    attempts: u32,
}

impl PingTransaction {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn packet(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.peer.len() + 6 + self.payload.len());
        buf.extend_from_slice(self.peer.as_bytes());
        buf.extend_from_slice(b":PING ");
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn transmit(&mut self, ctx: &mut LinkContext<'_>, retry: Duration) {
        debug!(
            link = %ctx.link_name(),
            peer = %self.peer,
            attempt = self.attempts + 1,
            "sending ping"
        );
        ctx.send_packet(&self.packet());
        self.attempts += 1;
        self.timer = Some(ctx.arm(PING_TAG, &self.peer, retry));
    }

    fn cancel_timer(&mut self, ctx: &mut LinkContext<'_>) {
        if let Some(handle) = self.timer.take() {
            if let Err(e) = ctx.cancel(handle) {
                warn!(peer = %self.peer, error = %e, "ping timer already gone");
            }
        }
    }
}

impl std::fmt::Debug for PingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingTransaction")
            .field("peer", &self.peer)
            .field("payload", &self.payload.len())
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Registry of pings keyed by destination callsign.
#[derive(Debug, Default)]
pub struct PingTable {
    config: PingConfig,
    transactions: HashMap<String, PingTransaction>,
}

impl PingTable {
    pub fn new(config: PingConfig) -> Self {
        Self {
            config,
            transactions: HashMap::new(),
        }
    }

    pub fn get(&self, peer: &str) -> Option<&PingTransaction> {
        self.transactions.get(peer)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn begin(&mut self, ctx: &mut LinkContext<'_>, peer: &str, payload: &[u8]) -> Result<()> {
        validate_peer(peer)?;

        if let Some(mut old) = self.transactions.remove(peer) {
            info!(peer = %peer, "replacing pending ping");
            old.cancel_timer(ctx);
        }

        let mut tx = PingTransaction {
            peer: peer.to_string(),
            payload: payload.to_vec(),
            timer: None,
            callback: None,
            attempts: 0,
        };
        tx.transmit(ctx, self.config.retry_interval);
        self.transactions.insert(peer.to_string(), tx);
        Ok(())
    }
}

impl PacketReceiver for PingTable {
    fn receive(&mut self, packet: &Packet, ctx: &mut LinkContext<'_>) {
        debug!(link = %ctx.link_name(), %packet, "ping: received packet");

        let Some(mut tx) = self.transactions.remove(&packet.from) else {
            warn!(from = %packet.from, "pong packet has unknown sender");
            return;
        };
        tx.cancel_timer(ctx);
        info!(peer = %tx.peer, attempts = tx.attempts, "ping transaction finished");

        if let Some(callback) = tx.callback.take() {
            let reply = packet.message.clone();
            ctx.defer(move || callback(reply));
        }
    }

    fn timeout(&mut self, key: &str, ctx: &mut LinkContext<'_>) {
        let retry = self.config.retry_interval;
        let Some(tx) = self.transactions.get_mut(key) else {
            debug!(peer = key, "timer for finished ping");
            return;
        };
        tx.timer = None;
        debug!(peer = key, "ping timeout, resending");
        tx.transmit(ctx, retry);
    }
}

/// Handle for starting and observing pings.
#[derive(Debug, Clone, Default)]
pub struct PingClient {
    table: Rc<RefCell<PingTable>>,
}

impl PingClient {
    pub fn new(config: PingConfig) -> Self {
        Self {
            table: Rc::new(RefCell::new(PingTable::new(config))),
        }
    }

    pub fn receiver(&self) -> SharedReceiver {
        self.table.clone()
    }

    /// Register the table on `link` under the `PONG` tag.
    pub fn register(&self, link: &mut LinkConnection) {
        link.add_protocol_handler(&[PING_TAG], self.receiver());
    }

    /// Ping `peer` with `payload`, replacing any ping already pending for it.
    pub fn begin(&self, ctx: &mut LinkContext<'_>, peer: &str, payload: &[u8]) -> Result<()> {
        self.table.borrow_mut().begin(ctx, peer, payload)
    }

    /// Set the completion callback of the ping pending for `peer`.
    pub fn on_result(&self, peer: &str, callback: impl FnOnce(Vec<u8>) + 'static) -> Result<()> {
        let mut table = self.table.borrow_mut();
        let tx = table
            .transactions
            .get_mut(peer)
            .ok_or_else(|| Error::InvalidParameter(format!("no pending ping to {peer}")))?;
        tx.callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn is_pending(&self, peer: &str) -> bool {
        self.table.borrow().get(peer).is_some()
    }

    /// Pings sent so far to `peer` by its pending transaction.
    pub fn attempts(&self, peer: &str) -> Option<u32> {
        self.table.borrow().get(peer).map(PingTransaction::attempts)
    }

    /// Number of pending pings.
    pub fn pending(&self) -> usize {
        self.table.borrow().len()
    }
}
