#![forbid(unsafe_code)]

//! `agent-tether-worker` — reference worker for manual end-to-end checks.
//!
//! Parses the launch arguments printed by `agent-tether`, binds its own
//! control listener, calls back with the handshake, and echoes every
//! control connection the host opens.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_tether::launch::handshake::encode_handshake;
use agent_tether::{AppError, ClassLoadingPolicy, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-tether-worker",
    about = "Reference worker for agent-tether",
    version,
    long_about = None
)]
struct Cli {
    /// Host handshake endpoint (`host:port`).
    #[arg(long)]
    agent_address: SocketAddr,

    /// Authorization key issued by the host.
    #[arg(long)]
    agent_key: String,

    /// Class-loading policy requested by the host.
    #[arg(long, default_value_t = ClassLoadingPolicy::Isolated)]
    class_loading: ClassLoadingPolicy,

    /// Seconds to wait for the host to accept the handshake connection.
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    let control = TcpListener::bind((args.agent_address.ip(), 0))?;
    let port = control.local_addr()?.port();
    info!(port, class_loading = %args.class_loading, "control listener bound");

    let frame = encode_handshake(&args.agent_key, port)?;
    let mut handshake = TcpStream::connect_timeout(
        &args.agent_address,
        Duration::from_secs(args.connect_timeout_secs),
    )
    .map_err(|err| AppError::Connect(format!("host at {} unreachable: {err}", args.agent_address)))?;
    handshake.write_all(&frame)?;
    handshake.flush()?;
    info!(host = %args.agent_address, "handshake sent");

    for accepted in control.incoming() {
        match accepted {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                std::thread::spawn(move || echo(&stream, peer));
            }
            Err(err) => warn!(%err, "control accept failed"),
        }
    }

    drop(handshake);
    Ok(())
}

fn echo(stream: &TcpStream, peer: Option<SocketAddr>) {
    info!(?peer, "control connection opened");
    let copied = stream
        .try_clone()
        .and_then(|mut reader| io::copy(&mut reader, &mut &*stream));
    match copied {
        Ok(bytes) => info!(?peer, bytes, "control connection closed"),
        Err(err) => warn!(?peer, %err, "control connection failed"),
    }
}
