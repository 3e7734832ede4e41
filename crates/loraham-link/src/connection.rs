//! One TCP link to the node simulator.
//!
//! [`LinkConnection`] owns the socket and its read/write buffers. Inbound
//! bytes are framed into `\r\n` lines and routed by tag; `pkt:` lines are
//! unwrapped into [`Packet`]s and handed to the protocol handler registered
//! for one of the packet's parameter keys.
//!
//! The connection never blocks: the event loop polls readiness and calls
//! [`pump_read`](LinkConnection::pump_read) /
//! [`pump_write`](LinkConnection::pump_write), which use the non-blocking
//! `try_read` / `try_write` on the stream.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::task::Context;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use loraham_core::error::{Error, Result};
use loraham_core::packet::Packet;

use crate::event_loop::{EventLoop, LinkId, Scheduler, Task, TimerHandle};
use crate::protocol::{self, EOL, LineTag};

/// Configuration for a link connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest single socket read.
    pub read_chunk: usize,
    /// Timeout for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Read buffer size past which unframed data is discarded.
    pub max_read_buf: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_chunk: 1500,
            connect_timeout: Duration::from_secs(5),
            max_read_buf: 8192,
        }
    }
}

/// Counters kept per link for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub lines: u64,
    pub dropped_lines: u64,
    pub framing_errors: u64,
    pub decode_failures: u64,
    pub packets: u64,
    pub dispatched: u64,
}

/// A protocol handler that consumes packets from a link.
///
/// Handlers are registered on a [`LinkConnection`] under one or more tags;
/// a packet is delivered to the handler whose tag matches one of its
/// parameter keys. Retry timers armed through
/// [`LinkContext::arm`] come back through [`PacketReceiver::timeout`].
pub trait PacketReceiver {
    /// A packet carrying one of this handler's tags arrived.
    fn receive(&mut self, packet: &Packet, ctx: &mut LinkContext<'_>);

    /// A timer armed with `key` expired.
    fn timeout(&mut self, key: &str, ctx: &mut LinkContext<'_>);
}

/// Shared handle to a registered protocol handler.
pub type SharedReceiver = Rc<RefCell<dyn PacketReceiver>>;

/// What a protocol handler may do to its link while handling an event.
///
/// Work queued with [`defer`](LinkContext::defer) runs after the handler
/// returns and its borrow is released, so completion callbacks can safely
/// call back into the handler's owner.
pub struct LinkContext<'a> {
    link: LinkId,
    name: &'a str,
    write_buf: &'a mut BytesMut,
    scheduler: &'a mut Scheduler<Task>,
    deferred: Vec<Box<dyn FnOnce()>>,
}

impl LinkContext<'_> {
    /// The link this context writes to.
    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn link_name(&self) -> &str {
        self.name
    }

    /// Queue raw text for the node.
    pub fn send(&mut self, text: &str) {
        self.write_buf.extend_from_slice(text.as_bytes());
    }

    /// Queue a raw packet for injection via `!pktx`.
    pub fn send_packet(&mut self, packet: &[u8]) {
        self.write_buf.extend_from_slice(&protocol::encode_pktx(packet));
    }

    /// Arm a timer that calls the handler registered under `tag` with
    /// `key` once `delay` has elapsed.
    pub fn arm(&mut self, tag: &str, key: &str, delay: Duration) -> TimerHandle {
        let link = self.link;
        let tag = tag.to_string();
        let key = key.to_string();
        self.scheduler.schedule(
            Box::new(move |ev: &mut EventLoop| ev.deliver_timeout(link, &tag, &key)),
            delay,
        )
    }

    /// Cancel a timer armed earlier.
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<()> {
        self.scheduler.cancel(handle).map(drop)
    }

    /// Run `f` once the current handler call returns.
    pub fn defer(&mut self, f: impl FnOnce() + 'static) {
        self.deferred.push(Box::new(f));
    }

    pub(crate) fn finish(self) {
        for job in self.deferred {
            job();
        }
    }
}

/// Readiness reported for one link by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// A buffered, line-framed TCP link to the node simulator.
pub struct LinkConnection {
    name: String,
    id: LinkId,
    /// `None` once closed.
    stream: Option<TcpStream>,
    config: LinkConfig,
    read_buf: BytesMut,
    write_buf: BytesMut,
    handlers: HashMap<String, SharedReceiver>,
    stats: LinkStats,
}

impl LinkConnection {
    /// Connect to the node simulator at `addr`.
    pub async fn connect(name: &str, addr: &str, config: LinkConfig) -> Result<Self> {
        debug!(link = %name, addr = %addr, "connecting to node");

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                error!(link = %name, addr = %addr, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                error!(link = %name, addr = %addr, error = %e, "TCP connection failed");
                Error::Transport(format!("failed to connect to {addr}: {e}"))
            })?;

        info!(link = %name, addr = %addr, "connected to node");
        Ok(Self::from_stream(name, stream, config))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(name: &str, stream: TcpStream, config: LinkConfig) -> Self {
        // Commands are short and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(link = %name, error = %e, "failed to set TCP_NODELAY (continuing anyway)");
        }
        Self {
            stream: Some(stream),
            ..Self::with_config(name, config)
        }
    }

    /// A link with no socket. Bytes are supplied with [`feed`](Self::feed)
    /// and output is inspected with [`pending_output`](Self::pending_output).
    pub fn detached(name: &str) -> Self {
        Self::with_config(name, LinkConfig::default())
    }

    fn with_config(name: &str, config: LinkConfig) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            stream: None,
            config,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            handlers: HashMap::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: LinkId) {
        self.id = id;
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether there is output waiting to be written.
    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Bytes queued for the node but not yet written.
    pub fn pending_output(&self) -> &[u8] {
        &self.write_buf
    }

    /// Remove and return all queued output.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.write_buf.split().to_vec()
    }

    /// Bytes received but not yet framed.
    pub fn pending_input(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Release the socket. Queued output is kept but never written.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(link = %self.name, "link closed");
        }
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    /// Queue text verbatim. The caller supplies terminators.
    pub fn send(&mut self, text: &str) {
        self.write_buf.extend_from_slice(text.as_bytes());
    }

    /// Queue a raw packet for injection via `!pktx`.
    pub fn send_packet(&mut self, packet: &[u8]) {
        self.write_buf
            .extend_from_slice(&protocol::encode_pktx(packet));
    }

    /// Switch the node's console into TNC mode.
    pub fn enter_tnc_mode(&mut self) {
        self.write_buf
            .extend_from_slice(&protocol::encode_command("!tnc"));
    }

    /// Ask the node to restart.
    pub fn reset(&mut self) {
        self.write_buf
            .extend_from_slice(&protocol::encode_command("!reset"));
    }

    /// Register `handler` under each of `tags`, replacing any earlier
    /// registration for the same tag.
    pub fn add_protocol_handler(&mut self, tags: &[&str], handler: SharedReceiver) {
        for tag in tags {
            if self
                .handlers
                .insert(tag.to_string(), handler.clone())
                .is_some()
            {
                debug!(link = %self.name, tag, "replacing protocol handler");
            }
        }
    }

    /// A handler context bound to this link.
    pub fn context<'a>(&'a mut self, scheduler: &'a mut Scheduler<Task>) -> LinkContext<'a> {
        LinkContext {
            link: self.id,
            name: &self.name,
            write_buf: &mut self.write_buf,
            scheduler,
            deferred: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Socket I/O
    // -----------------------------------------------------------------------

    pub(crate) fn poll_ready(&self, cx: &mut Context<'_>) -> Option<Readiness> {
        let stream = self.stream.as_ref()?;
        // An error counts as ready; the following read or write reports it.
        let readable = stream.poll_read_ready(cx).is_ready();
        let writable = self.wants_write() && stream.poll_write_ready(cx).is_ready();
        (readable || writable).then_some(Readiness { readable, writable })
    }

    /// Read what the socket has and interpret complete lines.
    pub fn pump_read(&mut self, scheduler: &mut Scheduler<Task>) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let mut buf = vec![0u8; self.config.read_chunk];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                info!(link = %self.name, "link closed on recv");
                self.close();
            }
            Ok(n) => self.feed(&buf[..n], scheduler),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(link = %self.name, error = %e, "read error, closing link");
                self.close();
            }
        }
    }

    /// Write as much queued output as the socket accepts.
    pub fn pump_write(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if self.write_buf.is_empty() {
            return;
        }
        match stream.try_write(&self.write_buf) {
            Ok(0) => {
                info!(link = %self.name, "link closed on send");
                self.close();
            }
            Ok(n) => self.write_buf.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(link = %self.name, error = %e, "write error, closing link");
                self.close();
            }
        }
    }

    // -----------------------------------------------------------------------
    // Framing
    // -----------------------------------------------------------------------

    /// Append received bytes and interpret every complete line.
    pub fn feed(&mut self, data: &[u8], scheduler: &mut Scheduler<Task>) {
        self.read_buf.extend_from_slice(data);
        self.interpret(scheduler);
    }

    fn interpret(&mut self, scheduler: &mut Scheduler<Task>) {
        while let Some(eol) = protocol::find_eol(&self.read_buf) {
            let mut line = self.read_buf.split_to(eol + EOL.len());
            line.truncate(eol);
            if line.is_empty() {
                continue;
            }
            if !self.interpret_line(&line, scheduler) {
                // Not complete yet; put it back and wait for more data.
                let mut restored =
                    BytesMut::with_capacity(line.len() + EOL.len() + self.read_buf.len());
                restored.extend_from_slice(&line);
                restored.extend_from_slice(EOL);
                restored.extend_from_slice(&self.read_buf);
                self.read_buf = restored;
                break;
            }
        }

        if self.read_buf.len() > self.config.max_read_buf {
            warn!(
                link = %self.name,
                len = self.read_buf.len(),
                "read buffer overflow, discarding"
            );
            self.read_buf.clear();
        }
    }

    /// Route one line (terminator stripped) by its tag.
    ///
    /// Returns `false` if the line is an incomplete packet line that must be
    /// pushed back until more data arrives.
    pub fn interpret_line(&mut self, line: &[u8], scheduler: &mut Scheduler<Task>) -> bool {
        self.stats.lines += 1;

        let Some((tag, body)) = protocol::classify_line(line) else {
            warn!(
                link = %self.name,
                line = %String::from_utf8_lossy(line),
                "unrecognized line"
            );
            self.stats.dropped_lines += 1;
            return true;
        };

        let text = || String::from_utf8_lossy(body);
        match tag {
            LineTag::Debug => debug!(link = %self.name, "debug {}", text()),
            LineTag::Cli => info!(link = %self.name, "cli {}", text()),
            LineTag::Net => info!(link = %self.name, "net {}", text()),
            LineTag::Callsign => info!(link = %self.name, "callsign {}", text()),
            LineTag::TncEcho => {}
            LineTag::Packet | LineTag::PacketRx => {
                return self.interpret_packet(body, scheduler);
            }
        }
        true
    }

    fn interpret_packet(&mut self, body: &[u8], scheduler: &mut Scheduler<Task>) -> bool {
        let header = match protocol::decode_packet_line(body) {
            Ok(header) => header,
            Err(e) => {
                warn!(link = %self.name, error = %e, "dropping malformed packet line");
                self.stats.framing_errors += 1;
                return true;
            }
        };

        let mut payload = header.payload.to_vec();
        if header.missing() > 0 {
            // The terminator that ended this line is part of the payload.
            payload.extend_from_slice(EOL);
            if payload.len() > header.len {
                warn!(
                    link = %self.name,
                    declared = header.len,
                    "packet bigger than expected across line break"
                );
                self.stats.framing_errors += 1;
                return true;
            }
            let needs = header.len - payload.len();
            if self.read_buf.len() < needs {
                debug!(link = %self.name, needs, "packet not complete yet, returning to buffer");
                return false;
            }
            payload.extend_from_slice(&self.read_buf.split_to(needs));
        }

        debug!(
            link = %self.name,
            rssi = header.rssi,
            len = header.len,
            payload = %String::from_utf8_lossy(&payload),
            "unwrapped packet"
        );

        match Packet::decode(&payload) {
            Ok(packet) => {
                self.stats.packets += 1;
                debug!(link = %self.name, %packet, "parsed packet");
                self.dispatch(&packet, scheduler);
            }
            Err(failure) => {
                warn!(
                    link = %self.name,
                    error = %failure.cause,
                    partial = %failure.partial,
                    "invalid packet"
                );
                self.stats.decode_failures += 1;
            }
        }
        true
    }

    /// Hand a decoded packet to the first handler registered for one of its
    /// parameter keys, visiting keys in sorted order.
    pub fn dispatch(&mut self, packet: &Packet, scheduler: &mut Scheduler<Task>) {
        let found = packet
            .params
            .keys()
            .find_map(|key| self.handlers.get(key).map(|h| (key, h.clone())));

        let Some((tag, handler)) = found else {
            debug!(link = %self.name, %packet, "no protocol handler for packet");
            return;
        };

        debug!(link = %self.name, tag, "calling protocol handler");
        self.stats.dispatched += 1;
        let mut ctx = self.context(scheduler);
        handler.borrow_mut().receive(packet, &mut ctx);
        ctx.finish();
    }

    pub(crate) fn deliver_timeout(&mut self, tag: &str, key: &str, scheduler: &mut Scheduler<Task>) {
        let Some(handler) = self.handlers.get(tag).cloned() else {
            warn!(link = %self.name, tag, key, "timer fired for unregistered protocol");
            return;
        };
        let mut ctx = self.context(scheduler);
        handler.borrow_mut().timeout(key, &mut ctx);
        ctx.finish();
    }
}

impl std::fmt::Debug for LinkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConnection")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("read_buf", &self.read_buf.len())
            .field("write_buf", &self.write_buf.len())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
