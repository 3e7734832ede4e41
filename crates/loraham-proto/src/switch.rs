//! Challenge-response remote switch protocol.
//!
//! A transaction reads or sets one numeric target on a peer node:
//!
//! ```text
//! harness -> peer   SW A,<challenge>
//! peer -> harness   SW B,<challenge>,<response>
//! harness -> peer   SW C,<challenge>,<response>,<target>,<value|?>
//! peer -> harness   SW D,<challenge>,<response>,<target>,<value|?>
//! ```
//!
//! `A` and `C` are resent every [`SwitchConfig::retry_interval`] until the
//! matching reply arrives. Transactions are correlated by their random
//! challenge; all of them live in one [`SwitchTable`] registered on the link
//! under the `SW` tag.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use loraham_core::error::{Error, Result};
use loraham_core::packet::Packet;
use loraham_link::{LinkConnection, LinkContext, PacketReceiver, SharedReceiver, TimerHandle};

use crate::validate_peer;

/// Parameter key that marks switch packets.
pub const SWITCH_TAG: &str = "SW";

/// Alphabet challenges are drawn from.
pub const CHALLENGE_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Shortest response accepted in a `B` reply.
pub const MIN_RESPONSE_LEN: usize = 8;

/// Completion callback: `(target, value)`.
pub type SwitchCallback = Box<dyn FnOnce(u32, Option<u16>)>;

/// Switch protocol settings.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Delay before an unanswered `A` or `C` is resent.
    pub retry_interval: Duration,
    /// Length of generated challenges.
    pub challenge_len: usize,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(3),
            challenge_len: 8,
        }
    }
}

/// Where a switch transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// `A` sent, waiting for `B`.
    A,
    /// `C` sent, waiting for `D`.
    C,
    /// `D` received; the transaction is finished.
    E,
}

/// One outstanding switch request.
pub struct SwitchTransaction {
    peer: String,
    challenge: String,
    target: u32,
    value: Option<u16>,
    response: Option<String>,
    state: SwitchState,
    timer: Option<TimerHandle>,
    callback: Option<SwitchCallback>,
    attempts: u32,
}

impl SwitchTransaction {
    fn new(peer: &str, challenge: String, target: u32, value: Option<u16>) -> Self {
        Self {
            peer: peer.to_string(),
            challenge,
            target,
            value,
            response: None,
            state: SwitchState::A,
            timer: None,
            callback: None,
            attempts: 0,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Requested value, `None` for a query.
    pub fn value(&self) -> Option<u16> {
        self.value
    }

    /// Response token received in `B`.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// Messages sent so far, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The packet for the current state.
    fn message(&self) -> String {
        match (self.state, &self.response) {
            (SwitchState::C, Some(response)) => {
                let value = self
                    .value
                    .map_or_else(|| "?".to_string(), |v| v.to_string());
                format!(
                    "{}:{SWITCH_TAG} C,{},{},{},{}",
                    self.peer, self.challenge, response, self.target, value
                )
            }
            _ => format!("{}:{SWITCH_TAG} A,{}", self.peer, self.challenge),
        }
    }

    /// Send the current message and arm the retry timer.
    fn transmit(&mut self, ctx: &mut LinkContext<'_>, retry: Duration) {
        let msg = self.message();
        debug!(
            link = %ctx.link_name(),
            challenge = %self.challenge,
            state = ?self.state,
            attempt = self.attempts + 1,
            "sending switch packet"
        );
        ctx.send_packet(msg.as_bytes());
        self.attempts += 1;
        self.timer = Some(ctx.arm(SWITCH_TAG, &self.challenge, retry));
    }

    fn cancel_timer(&mut self, ctx: &mut LinkContext<'_>) {
        if let Some(handle) = self.timer.take() {
            if let Err(e) = ctx.cancel(handle) {
                warn!(challenge = %self.challenge, error = %e, "switch timer already gone");
            }
        }
    }
}

impl std::fmt::Debug for SwitchTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchTransaction")
            .field("peer", &self.peer)
            .field("challenge", &self.challenge)
            .field("target", &self.target)
            .field("value", &self.value)
            .field("state", &self.state)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Registry of switch transactions keyed by challenge.
#[derive(Debug, Default)]
pub struct SwitchTable {
    config: SwitchConfig,
    transactions: HashMap<String, SwitchTransaction>,
}

impl SwitchTable {
    pub fn new(config: SwitchConfig) -> Self {
        Self {
            config,
            transactions: HashMap::new(),
        }
    }

    pub fn get(&self, challenge: &str) -> Option<&SwitchTransaction> {
        self.transactions.get(challenge)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    fn generate_challenge(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let challenge: String = (0..self.config.challenge_len)
                .map(|_| CHALLENGE_ALPHABET[rng.gen_range(0..CHALLENGE_ALPHABET.len())] as char)
                .collect();
            if !self.transactions.contains_key(&challenge) {
                return challenge;
            }
        }
    }

    fn begin(
        &mut self,
        ctx: &mut LinkContext<'_>,
        peer: &str,
        target: u32,
        value: Option<u16>,
    ) -> Result<String> {
        validate_peer(peer)?;
        let challenge = self.generate_challenge();
        info!(
            link = %ctx.link_name(),
            peer = %peer,
            challenge = %challenge,
            target,
            value = ?value,
            "starting switch transaction"
        );

        let mut tx = SwitchTransaction::new(peer, challenge.clone(), target, value);
        tx.transmit(ctx, self.config.retry_interval);
        self.transactions.insert(challenge.clone(), tx);
        Ok(challenge)
    }

    fn rx_b(&mut self, fields: &[&str], ctx: &mut LinkContext<'_>) {
        let retry = self.config.retry_interval;
        let Some(tx) = self.transactions.get_mut(fields[1]) else {
            return;
        };
        if tx.state != SwitchState::A {
            warn!(challenge = %tx.challenge, state = ?tx.state, "received packet B but state not A");
            return;
        }
        let response = fields[2];
        if response.chars().count() < MIN_RESPONSE_LEN {
            warn!(challenge = %tx.challenge, response, "received packet B with short response");
            return;
        }

        tx.cancel_timer(ctx);
        tx.response = Some(response.to_string());
        tx.state = SwitchState::C;
        tx.transmit(ctx, retry);
    }

    fn rx_d(&mut self, fields: &[&str], ctx: &mut LinkContext<'_>) {
        if fields.len() < 5 {
            warn!(fields = fields.len(), "received invalid packet D");
            return;
        }
        let Some(tx) = self.transactions.get_mut(fields[1]) else {
            return;
        };
        if tx.state != SwitchState::C {
            warn!(challenge = %tx.challenge, state = ?tx.state, "received packet D but state not C");
            return;
        }
        if tx.response.as_deref() != Some(fields[2]) {
            warn!(challenge = %tx.challenge, "received packet D with wrong response");
            return;
        }

        tx.cancel_timer(ctx);
        tx.state = SwitchState::E;
        let Some(mut tx) = self.transactions.remove(fields[1]) else {
            return;
        };

        let echoed = fields[3].parse::<u32>();
        let value = match fields[4] {
            "?" => Ok(None),
            v => v.parse::<u16>().map(Some),
        };

        let mut ok = true;
        if value.is_err() {
            warn!(challenge = %tx.challenge, value = fields[4], "value is invalid");
            ok = false;
        }
        match echoed {
            Ok(target) if target == tx.target => {}
            Ok(target) => {
                warn!(
                    challenge = %tx.challenge,
                    requested = tx.target,
                    returned = target,
                    "returned target different from request"
                );
                ok = false;
            }
            Err(_) => {
                warn!(challenge = %tx.challenge, target = fields[3], "returned target is invalid");
                ok = false;
            }
        }

        let target = echoed.unwrap_or(tx.target);
        let value = if ok { value.ok().flatten() } else { None };
        info!(
            challenge = %tx.challenge,
            target,
            value = ?value,
            ok,
            attempts = tx.attempts,
            "switch transaction finished"
        );

        if let Some(callback) = tx.callback.take() {
            ctx.defer(move || callback(target, value));
        }
    }
}

impl PacketReceiver for SwitchTable {
    fn receive(&mut self, packet: &Packet, ctx: &mut LinkContext<'_>) {
        debug!(link = %ctx.link_name(), %packet, "switch: received packet");

        let Ok(msg) = std::str::from_utf8(&packet.message) else {
            warn!("switch packet message is not UTF-8");
            return;
        };
        let fields: Vec<&str> = msg.split(',').collect();
        if fields.len() < 3 {
            warn!(msg, "switch packet message has less than 3 fields");
            return;
        }
        if !self.transactions.contains_key(fields[1]) {
            warn!(challenge = fields[1], "switch packet has unknown challenge");
            return;
        }

        match fields[0] {
            "B" => self.rx_b(&fields, ctx),
            "D" => self.rx_d(&fields, ctx),
            other => warn!(kind = other, "switch packet of unknown type"),
        }
    }

    fn timeout(&mut self, key: &str, ctx: &mut LinkContext<'_>) {
        let retry = self.config.retry_interval;
        let Some(tx) = self.transactions.get_mut(key) else {
            debug!(challenge = key, "timer for finished switch transaction");
            return;
        };
        // The handle that brought us here has already been consumed.
        tx.timer = None;
        debug!(challenge = key, state = ?tx.state, "switch timeout, resending");
        tx.transmit(ctx, retry);
    }
}

/// Handle for starting and observing switch transactions.
///
/// Clones share one [`SwitchTable`]; register it on a link with
/// [`register`](SwitchClient::register) before starting transactions.
#[derive(Debug, Clone, Default)]
pub struct SwitchClient {
    table: Rc<RefCell<SwitchTable>>,
}

impl SwitchClient {
    pub fn new(config: SwitchConfig) -> Self {
        Self {
            table: Rc::new(RefCell::new(SwitchTable::new(config))),
        }
    }

    /// The table as a link protocol handler.
    pub fn receiver(&self) -> SharedReceiver {
        self.table.clone()
    }

    /// Register the table on `link` under the `SW` tag.
    pub fn register(&self, link: &mut LinkConnection) {
        link.add_protocol_handler(&[SWITCH_TAG], self.receiver());
    }

    /// Start a transaction against `peer`, returning its challenge.
    ///
    /// `value` of `None` queries the target without changing it.
    pub fn begin(
        &self,
        ctx: &mut LinkContext<'_>,
        peer: &str,
        target: u32,
        value: Option<u16>,
    ) -> Result<String> {
        self.table.borrow_mut().begin(ctx, peer, target, value)
    }

    /// Set the completion callback of a pending transaction.
    pub fn on_result(
        &self,
        challenge: &str,
        callback: impl FnOnce(u32, Option<u16>) + 'static,
    ) -> Result<()> {
        let mut table = self.table.borrow_mut();
        let tx = table.transactions.get_mut(challenge).ok_or_else(|| {
            Error::InvalidParameter(format!("no pending switch transaction {challenge}"))
        })?;
        tx.callback = Some(Box::new(callback));
        Ok(())
    }

    /// State of a pending transaction. Finished transactions are gone.
    pub fn state(&self, challenge: &str) -> Option<SwitchState> {
        self.table.borrow().get(challenge).map(SwitchTransaction::state)
    }

    /// Messages sent so far by a pending transaction.
    pub fn attempts(&self, challenge: &str) -> Option<u32> {
        self.table.borrow().get(challenge).map(SwitchTransaction::attempts)
    }

    /// Number of pending transactions.
    pub fn pending(&self) -> usize {
        self.table.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loraham_link::protocol::{encode_packet_line, encode_pktx};
    use loraham_link::{EventLoop, LinkId};

    const PEER: &str = "PU5EPX-11";

    type Outcome = Rc<RefCell<Vec<(u32, Option<u16>)>>>;

    fn setup() -> (EventLoop, LinkId, SwitchClient) {
        let mut ev = EventLoop::new();
        let client = SwitchClient::new(SwitchConfig::default());
        let mut link = LinkConnection::detached("client");
        client.register(&mut link);
        let id = ev.add_link(link);
        (ev, id, client)
    }

    fn begin(ev: &mut EventLoop, id: LinkId, client: &SwitchClient, value: Option<u16>) -> String {
        ev.with_link(id, |ctx| client.begin(ctx, PEER, 3, value))
            .unwrap()
            .unwrap()
    }

    fn collect(client: &SwitchClient, challenge: &str) -> Outcome {
        let outcome: Outcome = Rc::default();
        let sink = outcome.clone();
        client
            .on_result(challenge, move |t, v| sink.borrow_mut().push((t, v)))
            .unwrap();
        outcome
    }

    fn reply(ev: &mut EventLoop, id: LinkId, msg: &str) {
        let payload = format!("PU5EPX-1<{PEER}:{SWITCH_TAG} {msg}");
        ev.feed(id, &encode_packet_line(-60.0, payload.as_bytes()))
            .unwrap();
    }

    fn output(ev: &mut EventLoop, id: LinkId) -> Vec<u8> {
        ev.link_mut(id).unwrap().take_output()
    }

    fn sent(packet: &str) -> Vec<u8> {
        encode_pktx(packet.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Start and retry
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn begin_sends_challenge() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));

        assert_eq!(ch.len(), 8);
        assert!(ch.bytes().all(|b| CHALLENGE_ALPHABET.contains(&b)));
        assert_eq!(output(&mut ev, id), sent(&format!("{PEER}:SW A,{ch}")));
        assert_eq!(client.state(&ch), Some(SwitchState::A));
        assert_eq!(client.pending(), 1);
        assert_eq!(ev.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn challenges_are_distinct() {
        let (mut ev, id, client) = setup();
        let a = begin(&mut ev, id, &client, None);
        let b = begin(&mut ev, id, &client, None);
        assert_ne!(a, b);
        assert_eq!(client.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_peer_is_rejected() {
        let (mut ev, id, client) = setup();
        let result = ev.with_link(id, |ctx| client.begin(ctx, "", 3, None)).unwrap();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
        assert!(ev.link(id).unwrap().pending_output().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resends_identical_a() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, None);
        let first = output(&mut ev, id);

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert_eq!(ev.fire_expired(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(output(&mut ev, id), first);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(output(&mut ev, id), first);

        assert_eq!(client.attempts(&ch), Some(3));
        assert_eq!(ev.pending_timers(), 1);
    }

    // -----------------------------------------------------------------------
    // Full exchange
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_transaction() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        output(&mut ev, id);

        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        assert_eq!(client.state(&ch), Some(SwitchState::C));
        assert_eq!(
            output(&mut ev, id),
            sent(&format!("{PEER}:SW C,{ch},resp0001,3,1"))
        );
        assert_eq!(ev.pending_timers(), 1);

        reply(&mut ev, id, &format!("D,{ch},resp0001,3,1"));
        assert_eq!(*outcome.borrow(), [(3, Some(1))]);
        assert_eq!(client.state(&ch), None);
        assert_eq!(client.pending(), 0);
        assert_eq!(ev.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_transaction() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, None);
        let outcome = collect(&client, &ch);
        output(&mut ev, id);

        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        assert_eq!(
            output(&mut ev, id),
            sent(&format!("{PEER}:SW C,{ch},resp0001,3,?"))
        );

        reply(&mut ev, id, &format!("D,{ch},resp0001,3,65535"));
        assert_eq!(*outcome.borrow(), [(3, Some(65535))]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_in_c_resends_c() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(7));
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        output(&mut ev, id);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(
            output(&mut ev, id),
            sent(&format!("{PEER}:SW C,{ch},resp0001,3,7"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn callback_fires_exactly_once() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,3,1"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,3,1"));
        tokio::time::advance(Duration::from_secs(10)).await;
        ev.fire_expired();
        assert_eq!(outcome.borrow().len(), 1);
    }

    // -----------------------------------------------------------------------
    // Ignored replies
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn mismatched_challenge_is_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        output(&mut ev, id);

        reply(&mut ev, id, "B,zzzzzzzz,resp0001");
        assert_eq!(client.state(&ch), Some(SwitchState::A));
        assert!(output(&mut ev, id).is_empty());
        assert_eq!(ev.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_response_is_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        output(&mut ev, id);

        reply(&mut ev, id, &format!("B,{ch},short"));
        assert_eq!(client.state(&ch), Some(SwitchState::A));
        assert!(output(&mut ev, id).is_empty());

        // The retry timer keeps running.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(output(&mut ev, id), sent(&format!("{PEER}:SW A,{ch}")));
    }

    #[tokio::test(start_paused = true)]
    async fn short_response_counts_characters() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        output(&mut ev, id);

        // Eight bytes, four characters.
        reply(&mut ev, id, &format!("B,{ch},\u{e9}\u{e9}\u{e9}\u{e9}"));
        assert_eq!(client.state(&ch), Some(SwitchState::A));
        assert!(output(&mut ev, id).is_empty());

        let long = "\u{e9}".repeat(8);
        reply(&mut ev, id, &format!("B,{ch},{long}"));
        assert_eq!(client.state(&ch), Some(SwitchState::C));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        output(&mut ev, id);

        reply(&mut ev, id, "B");
        reply(&mut ev, id, &format!("B,{ch}"));
        reply(&mut ev, id, &format!("X,{ch},resp0001"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,3,1"));
        ev.feed(
            id,
            &encode_packet_line(-60.0, b"PU5EPX-1<PU5EPX-11:SW \xff,\xfe,\xfd"),
        )
        .unwrap();

        assert_eq!(client.state(&ch), Some(SwitchState::A));
        assert!(output(&mut ev, id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_response_in_d_is_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));

        reply(&mut ev, id, &format!("D,{ch},resp0002,3,1"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,3"));
        assert_eq!(client.state(&ch), Some(SwitchState::C));
        assert!(outcome.borrow().is_empty());
        assert_eq!(ev.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_challenge_in_d_is_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        output(&mut ev, id);

        reply(&mut ev, id, "D,zzzzzzzz,resp0001,3,1");
        assert_eq!(client.state(&ch), Some(SwitchState::C));
        assert!(outcome.borrow().is_empty());
        assert!(output(&mut ev, id).is_empty());
        assert_eq!(ev.pending_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn b_after_c_is_ignored() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        output(&mut ev, id);

        reply(&mut ev, id, &format!("B,{ch},resp0002"));
        assert!(output(&mut ev, id).is_empty());
        assert_eq!(client.state(&ch), Some(SwitchState::C));
    }

    // -----------------------------------------------------------------------
    // Invalid outcomes
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn different_target_reports_echoed_target_without_value() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,4,1"));
        assert_eq!(*outcome.borrow(), [(4, None)]);
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_value_reports_none() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,3,65536"));
        assert_eq!(*outcome.borrow(), [(3, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_target_reports_requested_target() {
        let (mut ev, id, client) = setup();
        let ch = begin(&mut ev, id, &client, Some(1));
        let outcome = collect(&client, &ch);
        reply(&mut ev, id, &format!("B,{ch},resp0001"));
        reply(&mut ev, id, &format!("D,{ch},resp0001,x,1"));
        assert_eq!(*outcome.borrow(), [(3, None)]);
        assert_eq!(ev.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn on_result_for_unknown_challenge() {
        let (_ev, _id, client) = setup();
        assert!(matches!(
            client.on_result("nope", |_, _| {}),
            Err(Error::InvalidParameter(_))
        ));
    }
}
