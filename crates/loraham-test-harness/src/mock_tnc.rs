//! Mock node simulator for link-level testing.
//!
//! [`MockTnc`] listens on a random loopback port and plays the node side of
//! the console protocol: it reads `\r`-terminated commands, decodes `!pktx`
//! packet injections and answers them through a scripted responder. Other
//! commands (`!tnc`, `!reset`, ...) are only recorded.
//!
//! # Example
//!
//! ```
//! use loraham_test_harness::{MockTnc, responders};
//!
//! # async fn example() -> loraham_core::Result<()> {
//! let mut tnc = MockTnc::new().await?;
//! tnc.respond_with(responders::ping_echo("PU5EPX-1"));
//! tnc.start();
//!
//! // Connect a LinkConnection to tnc.addr() and run the event loop ...
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use loraham_core::error::{Error, Result};
use loraham_link::protocol::{self, COMMAND_TERMINATOR};

/// Produces the bytes the node writes back for one injected packet.
///
/// Called with the raw packet of each `!pktx` command; an empty return
/// writes nothing.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Everything the mock observed from its client.
#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<String>,
    packets: Vec<Vec<u8>>,
}

/// A scripted TCP stand-in for the node simulator.
///
/// Accepts a single connection once [`start`](MockTnc::start) is called.
/// [`shutdown`](MockTnc::shutdown) stops the server task and closes the
/// connection, which the link sees as the peer hanging up.
pub struct MockTnc {
    addr: String,
    listener: Option<TcpListener>,
    greeting: Vec<u8>,
    responder: Option<Responder>,
    recorded: Arc<Mutex<Recorded>>,
    cancel: CancellationToken,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTnc {
    /// Bind a mock on a random loopback port.
    ///
    /// The listener is held from here on, so clients may connect before
    /// [`start`](MockTnc::start); the connection is accepted once it runs.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TNC: {e}")))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();

        Ok(Self {
            addr,
            listener: Some(listener),
            greeting: Vec::new(),
            responder: None,
            recorded: Arc::default(),
            cancel: CancellationToken::new(),
            server_handle: None,
        })
    }

    /// Address to connect the link to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Bytes written as soon as the client connects, e.g. boot log lines.
    pub fn greet(&mut self, bytes: &[u8]) {
        self.greeting.extend_from_slice(bytes);
    }

    /// Answer injected packets with `responder`.
    pub fn respond_with(&mut self, responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) {
        self.responder = Some(Box::new(responder));
    }

    /// Start serving in a background task.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let greeting = std::mem::take(&mut self.greeting);
        let responder = self.responder.take();
        let recorded = self.recorded.clone();
        let cancel = self.cancel.clone();

        self.server_handle = Some(tokio::spawn(async move {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    accepted.map_err(|e| format!("failed to accept connection: {e}"))?
                }
            };
            debug!(peer = %peer, "mock TNC accepted connection");
            serve(stream, greeting, responder, recorded, cancel).await
        }));
    }

    /// Non-packet commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.recorded).commands.clone()
    }

    /// Raw packets injected with `!pktx` so far, in order.
    pub fn packets(&self) -> Vec<Vec<u8>> {
        lock(&self.recorded).packets.clone()
    }

    /// Stop the server task, close the connection and report any error the
    /// task hit.
    pub async fn shutdown(mut self) -> std::result::Result<(), String> {
        self.cancel.cancel();
        match self.server_handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Ok(()),
        }
    }
}

impl Drop for MockTnc {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(recorded: &Mutex<Recorded>) -> MutexGuard<'_, Recorded> {
    recorded.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve(
    mut stream: TcpStream,
    greeting: Vec<u8>,
    mut responder: Option<Responder>,
    recorded: Arc<Mutex<Recorded>>,
    cancel: CancellationToken,
) -> std::result::Result<(), String> {
    if !greeting.is_empty() {
        stream
            .write_all(&greeting)
            .await
            .map_err(|e| format!("greeting write error: {e}"))?;
    }

    let mut pending = Vec::new();
    let mut buf = [0u8; 1500];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read(&mut buf) => read.map_err(|e| format!("read error: {e}"))?,
        };
        if n == 0 {
            debug!("mock TNC client disconnected");
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);

        while let Some(end) = pending.iter().position(|&b| b == COMMAND_TERMINATOR) {
            let line: Vec<u8> = pending.drain(..=end).take(end).collect();
            if line.is_empty() {
                continue;
            }

            let Some(packet) = protocol::decode_pktx(&line) else {
                let cmd = String::from_utf8_lossy(&line).into_owned();
                debug!(cmd = %cmd, "mock TNC command");
                lock(&recorded).commands.push(cmd);
                continue;
            };

            debug!(packet = %String::from_utf8_lossy(&packet), "mock TNC packet");
            let reply = responder
                .as_mut()
                .map(|respond| respond(&packet))
                .unwrap_or_default();
            lock(&recorded).packets.push(packet);

            if !reply.is_empty() {
                stream
                    .write_all(&reply)
                    .await
                    .map_err(|e| format!("reply write error: {e}"))?;
            }
        }
    }
}
