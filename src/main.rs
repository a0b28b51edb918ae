//! Frida MCP Server
//!
//! This binary runs an MCP server over stdin/stdout. Instrumentation is
//! delegated to a bridge helper process that speaks newline-delimited JSON.

use clap::{Args, Parser, Subcommand};
use frida_mcp::config::{
    DEFAULT_BACKEND_TIMEOUT_SECS, DEFAULT_MAX_WAIT_SECS, DEFAULT_RECEIPT_TIMEOUT_SECS,
    DEFAULT_RETIRED_CAPACITY,
};
use frida_mcp::{BridgeBackend, BridgeConfig, FridaMcpServer, ManagerConfig, SessionManager};
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "frida-mcp",
    version,
    about = "Dynamic instrumentation MCP Server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server (default)
    Serve(ServeArgs),
}

#[derive(Args, Clone)]
struct ServeArgs {
    /// Bridge helper program that drives the instrumentation toolkit
    #[arg(long, env = "FRIDA_MCP_BRIDGE")]
    bridge: Option<PathBuf>,
    /// Extra argument passed to the bridge helper (repeatable)
    #[arg(long = "bridge-arg", allow_hyphen_values = true)]
    bridge_args: Vec<String>,
    /// Seconds before an unanswered bridge request counts as a lost backend
    #[arg(long, default_value_t = DEFAULT_BACKEND_TIMEOUT_SECS)]
    backend_timeout_secs: u64,
    /// Seconds to wait for a script's execution receipt
    #[arg(long, default_value_t = DEFAULT_RECEIPT_TIMEOUT_SECS)]
    receipt_timeout_secs: u64,
    /// Hard cap for get_messages waits, in seconds
    #[arg(long, default_value_t = DEFAULT_MAX_WAIT_SECS)]
    max_wait_secs: u64,
    /// Detached sessions kept for a final get_messages
    #[arg(long, default_value_t = DEFAULT_RETIRED_CAPACITY)]
    retired_capacity: usize,
}

impl ServeArgs {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let program = self.bridge.clone().ok_or_else(|| {
            anyhow::anyhow!("no bridge helper configured (use --bridge or FRIDA_MCP_BRIDGE)")
        })?;
        let mut config = BridgeConfig::new(program);
        config.args = self.bridge_args.clone();
        config.request_timeout = Duration::from_secs(self.backend_timeout_secs);
        Ok(config)
    }

    fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            receipt_timeout: Duration::from_secs(self.receipt_timeout_secs),
            max_wait: Duration::from_secs(self.max_wait_secs),
            retired_capacity: self.retired_capacity,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging to stderr (stdout is used for MCP protocol)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("frida_mcp=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Serve(args)) => run_server(args),
        None => run_server(cli.serve),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    info!("Starting Frida MCP Server");

    let bridge = BridgeBackend::launch(args.bridge_config()?)?;
    let manager = Arc::new(SessionManager::new(
        Arc::new(bridge),
        args.manager_config(),
    ));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        info!("MCP server listening on stdio");
        let server = FridaMcpServer::new(manager.clone());
        let mut service = Some(server.serve(stdio()).await?);
        let shutdown_notify = Arc::new(Notify::new());
        let shutdown_signal = shutdown_notify.clone();

        tokio::spawn(async move {
            if wait_for_shutdown_signal().await.is_ok() {
                info!("Shutdown signal received");
                shutdown_signal.notify_one();
            } else {
                info!("Shutdown signal handler failed; server will continue running");
            }
        });

        loop {
            tokio::select! {
                _ = shutdown_notify.notified() => {
                    if let Some(mut running) = service.take() {
                        let _ = running.close().await?;
                    }
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    if let Some(running) = service.as_ref() {
                        if running.is_transport_closed() {
                            if let Some(running) = service.take() {
                                let _ = running.waiting().await?;
                            }
                            break;
                        }
                    }
                }
            }
        }
        info!("MCP server shutting down");
        manager.shutdown_all().await;
        Ok::<_, anyhow::Error>(())
    })?;

    info!("Server stopped");
    Ok(())
}
