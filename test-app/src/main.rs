// LoRaHam harness test application -- drives the client and server nodes of
// a running node simulator over TCP.
//
// Usage:
//   loraham-test-app --client-port 6000 --server-port 6001 monitor
//   loraham-test-app --client-port 6000 --server-port 6001 --reset-after 60 monitor
//   loraham-test-app --client-port 6000 --server-port 6001 \
//       ping --dest PU5EPX-11 --payload hello --count 5
//   loraham-test-app --client-port 6000 --server-port 6001 \
//       switch --dest PU5EPX-11 --target 3 --value 1
//   loraham-test-app --client-port 6000 --server-port 6001 \
//       switch --dest PU5EPX-11 --target 3

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use loraham_link::{EventLoop, LinkConfig, LinkConnection, LinkId};
use loraham_proto::{PingClient, PingConfig, SwitchClient, SwitchConfig};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// LoRaHam harness test application -- exercises a node simulator from the
/// command line.
#[derive(Parser)]
#[command(name = "loraham-test-app", version, about)]
struct Cli {
    /// TCP port of the client node's console.
    #[arg(long)]
    client_port: u16,

    /// TCP port of the server node's console.
    #[arg(long)]
    server_port: u16,

    /// Host running the simulator.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Log filter (e.g. info, debug, loraham_link=trace). RUST_LOG wins if set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Send `!reset` to both nodes after this many seconds.
    #[arg(long)]
    reset_after: Option<u64>,

    /// Seconds to wait for a transaction before giving up.
    #[arg(long, default_value_t = 60)]
    wait: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log everything both nodes print until they disconnect.
    Monitor,

    /// Ping a peer from the client node and check the echo.
    Ping {
        /// Destination callsign.
        #[arg(long)]
        dest: String,

        /// Ping payload.
        #[arg(long, default_value = "loraham")]
        payload: String,

        /// Number of sequential pings.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Query or set a remote switch target from the client node.
    Switch {
        /// Destination callsign.
        #[arg(long)]
        dest: String,

        /// Target number on the peer.
        #[arg(long)]
        target: u32,

        /// Value to set. Omit to query.
        #[arg(long)]
        value: Option<u16>,
    },
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Both node links plus the protocol clients registered on the client link.
struct Harness {
    ev: EventLoop,
    client: LinkId,
    switch: SwitchClient,
    ping: PingClient,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn validate_options(cli: &Cli) -> Result<()> {
    if cli.client_port == cli.server_port {
        bail!("--client-port and --server-port must differ");
    }
    if cli.wait == 0 {
        bail!("--wait must be at least 1 second");
    }
    if let Command::Ping { count: 0, .. } = cli.command {
        bail!("--count must be at least 1");
    }
    Ok(())
}

async fn open(cli: &Cli, name: &str, port: u16) -> Result<LinkConnection> {
    let addr = format!("{}:{port}", cli.host);
    let mut link = LinkConnection::connect(name, &addr, LinkConfig::default())
        .await
        .with_context(|| format!("failed to connect {name} node at {addr}"))?;
    link.enter_tnc_mode();
    println!("Connected to {name} node at {addr}");
    Ok(link)
}

async fn create_harness(cli: &Cli) -> Result<Harness> {
    let mut client = open(cli, "client", cli.client_port).await?;
    let server = open(cli, "server", cli.server_port).await?;

    let switch = SwitchClient::new(SwitchConfig::default());
    let ping = PingClient::new(PingConfig::default());
    switch.register(&mut client);
    ping.register(&mut client);

    let mut ev = EventLoop::new();
    let client = ev.add_link(client);
    let server = ev.add_link(server);

    if let Some(secs) = cli.reset_after {
        ev.schedule(Duration::from_secs(secs), move |ev| {
            info!("resetting nodes");
            for id in [client, server] {
                if let Some(link) = ev.link_mut(id) {
                    link.reset();
                }
            }
        });
    }

    Ok(Harness {
        ev,
        client,
        switch,
        ping,
    })
}

// ---------------------------------------------------------------------------
// Command implementations
// ---------------------------------------------------------------------------

async fn cmd_monitor(h: &mut Harness) -> Result<()> {
    while h.ev.run_once().await {}
    for link in h.ev.links() {
        let stats = link.stats();
        println!(
            "{}: {} lines, {} packets, {} dispatched, {} framing errors, {} decode failures, {} dropped",
            link.name(),
            stats.lines,
            stats.packets,
            stats.dispatched,
            stats.framing_errors,
            stats.decode_failures,
            stats.dropped_lines
        );
    }
    println!("All links closed.");
    Ok(())
}

async fn cmd_ping(h: &mut Harness, dest: &str, payload: &str, count: u32, wait: Duration) -> Result<()> {
    let mut rtts = Vec::with_capacity(count as usize);

    for n in 1..=count {
        let ping = h.ping.clone();
        h.ev
            .with_link(h.client, |ctx| ping.begin(ctx, dest, payload.as_bytes()))??;

        let reply = Rc::new(RefCell::new(None));
        let sink = reply.clone();
        h.ping
            .on_result(dest, move |msg| *sink.borrow_mut() = Some(msg))?;

        let start = Instant::now();
        let done = reply.clone();
        if !h.ev.run_until(move |_| done.borrow().is_some(), wait).await {
            bail!(
                "ping {n}/{count}: no reply from {dest} after {}s ({} attempts)",
                wait.as_secs(),
                h.ping.attempts(dest).unwrap_or(0)
            );
        }
        let rtt = start.elapsed();

        let reply = reply.borrow_mut().take().unwrap_or_default();
        if reply != payload.as_bytes() {
            bail!(
                "ping {n}/{count}: reply {:?} does not echo payload {payload:?}",
                String::from_utf8_lossy(&reply)
            );
        }
        println!("ping {n}/{count}: reply from {dest} in {rtt:.1?}");
        rtts.push(rtt);
    }

    if let (Some(min), Some(max)) = (rtts.iter().min(), rtts.iter().max()) {
        let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
        println!("{count} pings: min {min:.1?} avg {avg:.1?} max {max:.1?}");
    }
    Ok(())
}

async fn cmd_switch(
    h: &mut Harness,
    dest: &str,
    target: u32,
    value: Option<u16>,
    wait: Duration,
) -> Result<()> {
    let switch = h.switch.clone();
    let challenge = h
        .ev
        .with_link(h.client, |ctx| switch.begin(ctx, dest, target, value))??;

    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    h.switch
        .on_result(&challenge, move |t, v| *sink.borrow_mut() = Some((t, v)))?;

    let done = outcome.clone();
    if !h.ev.run_until(move |_| done.borrow().is_some(), wait).await {
        bail!(
            "switch {challenge}: no answer from {dest} after {}s (state {:?})",
            wait.as_secs(),
            h.switch.state(&challenge)
        );
    }

    let result = *outcome.borrow();
    let Some((t, value)) = result else {
        bail!("switch {challenge}: finished without an outcome");
    };
    match value {
        Some(v) => println!("{dest} target {t}: value {v}"),
        None => println!("{dest} target {t}: no valid value"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    validate_options(&cli)?;

    let mut harness = create_harness(&cli).await?;
    let wait = Duration::from_secs(cli.wait);

    match &cli.command {
        Command::Monitor => cmd_monitor(&mut harness).await,
        Command::Ping {
            dest,
            payload,
            count,
        } => cmd_ping(&mut harness, dest, payload, *count, wait).await,
        Command::Switch {
            dest,
            target,
            value,
        } => cmd_switch(&mut harness, dest, *target, *value, wait).await,
    }
}
