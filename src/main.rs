#![forbid(unsafe_code)]

//! `agent-tether` — allocate one agent slot and bridge it to the terminal.
//!
//! Prints the launch arguments the worker must be started with, waits for
//! the worker to call back, then pipes stdin/stdout through a control
//! connection until either side closes.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_tether::{AppError, LaunchManager, Result, TetherConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-tether", about = "Host-side link to a code-execution worker", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Project or run configuration the agent is opened for.
    #[arg(long, default_value = "default")]
    identity: String,

    /// Seconds to wait for the worker's handshake.
    #[arg(long, default_value_t = 60)]
    ready_timeout_secs: u64,

    /// Print the launch arguments as JSON instead of a command-line fragment.
    #[arg(long)]
    print_json: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    let config = match &args.config {
        Some(path) => TetherConfig::load_from_path(path)?,
        None => TetherConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agent-tether")
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;

    let manager = LaunchManager::start(config, runtime.handle().clone())?;
    let outcome = run(&manager, &args);
    manager.stop();
    runtime.shutdown_timeout(Duration::from_secs(1));
    outcome
}

fn run(manager: &LaunchManager, args: &Cli) -> Result<()> {
    let agent = manager.open_for_project(&args.identity, false)?;
    let launch = agent.launch_args();

    let mut stdout = io::stdout();
    if args.print_json {
        let rendered = serde_json::to_string(&launch)
            .map_err(|err| AppError::Io(format!("failed to render launch args: {err}")))?;
        writeln!(stdout, "{rendered}")?;
    } else {
        writeln!(stdout, "{launch}")?;
    }
    stdout.flush()?;

    if !agent.wait_ready(Duration::from_secs(args.ready_timeout_secs)) {
        return Err(AppError::HandshakeTimeout(format!(
            "worker for agent {} did not call back within {}s",
            agent.key(),
            args.ready_timeout_secs
        )));
    }
    info!(key = %agent.key(), callback = ?agent.callback_address(), "worker ready");

    let connection = agent.create_connection()?;
    let mut input = connection.input()?;
    let mut output = connection.output()?;

    std::thread::Builder::new()
        .name("stdin-pump".into())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            if let Err(err) = io::copy(&mut stdin, &mut output) {
                warn!(%err, "stdin pump stopped");
            }
        })
        .map_err(|err| AppError::Io(format!("failed to spawn stdin pump: {err}")))?;

    let mut stdout = io::stdout().lock();
    match io::copy(&mut input, &mut stdout) {
        Ok(bytes) => info!(bytes, "worker closed the connection"),
        Err(err) => error!(%err, "connection read failed"),
    }
    stdout.flush()?;
    connection.close();
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
