use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use hpxdash::agent::Agent;
use hpxdash::config::Config;
use hpxdash::server::Server;

/// Performance-counter and task telemetry collector for HPX programs.
#[derive(Parser)]
#[command(name = "hpxdash", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read program output and stream its telemetry to a server.
    Agent(AgentArgs),
    /// Receive telemetry from agents into the run store.
    Server(ServerArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct AgentArgs {
    /// Program output to read; stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Server address.
    #[arg(long)]
    address: Option<String>,

    /// Server port.
    #[arg(long)]
    port: Option<u16>,

    /// Forward program output to the server.
    #[arg(long)]
    send_stdout: bool,

    /// Keep telemetry lines in echoed and forwarded output.
    #[arg(long)]
    send_all_stdout: bool,

    /// Echo program output to the console.
    #[arg(long)]
    print_out: bool,

    /// Copy program output to this file.
    #[arg(long)]
    out_file: Option<PathBuf>,
}

#[derive(Args)]
struct ServerArgs {
    /// Listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Parent directory for new session directories.
    #[arg(long)]
    save_path: Option<PathBuf>,

    /// Session directory to import at startup.
    #[arg(long)]
    import: Option<PathBuf>,

    /// Do not save finalized runs.
    #[arg(long)]
    no_persist: bool,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = &cli.command {
        println!("hpxdash {}", version::full());
        return Ok(());
    }

    // Initialize tracing. Logs go to stderr so echoed output stays clean.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = Config::load_or_default(cli.config.as_deref())?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting hpxdash",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Agent(args) => {
            let input = args.input.clone();
            apply_agent_args(&mut cfg, args);
            cfg.validate()?;
            rt.block_on(run_agent(cfg, input))
        }
        Command::Server(args) => {
            apply_server_args(&mut cfg, args);
            cfg.validate()?;
            rt.block_on(run_server(cfg))
        }
        Command::Version => Ok(()),
    }
}

fn apply_agent_args(cfg: &mut Config, args: AgentArgs) {
    let agent = &mut cfg.agent;
    if let Some(address) = args.address {
        agent.address = address;
    }
    if let Some(port) = args.port {
        agent.port = port;
    }
    agent.send_stdout |= args.send_stdout;
    agent.send_all_stdout |= args.send_all_stdout;
    agent.print_out |= args.print_out;
    if args.out_file.is_some() {
        agent.out_file = args.out_file;
    }
}

fn apply_server_args(cfg: &mut Config, args: ServerArgs) {
    let server = &mut cfg.server;
    if let Some(port) = args.port {
        server.port = port;
    }
    if let Some(path) = args.save_path {
        server.persistence.save_path = path;
    }
    if args.import.is_some() {
        server.persistence.import_path = args.import;
    }
    if args.no_persist {
        server.persistence.enabled = false;
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

async fn run_agent(cfg: Config, input: Option<PathBuf>) -> Result<()> {
    let agent = Agent::new(cfg.agent, input);

    // A signal ends the input early; the collection is still closed.
    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => cancel.cancel(),
            Err(e) => tracing::error!(error = %e, "signal handling unavailable"),
        }
    });

    let written = agent.run().await?;

    tracing::info!(messages = written, "hpxdash agent stopped");

    Ok(())
}

async fn run_server(cfg: Config) -> Result<()> {
    let mut server = Server::new(cfg.server)?;
    server.start().await?;

    // Wait for shutdown signal.
    shutdown_signal().await?;

    // Graceful shutdown.
    server.stop().await?;

    tracing::info!("hpxdash server stopped");

    Ok(())
}
