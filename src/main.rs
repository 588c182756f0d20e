use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use capgate::config::{present, Config};
use capgate::console::{Console, Reply};
use capgate::Sandbox;

fn print_help() {
    println!(
        "\
capgate v{}

Capability-gated action-execution sandbox with an operator console.

USAGE:
    capgate [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/capgate.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                 Log level filter for tracing
                             (e.g. debug, capgate=debug,warn)
    CAPGATE_SECRET           Capability token signing secret
    CAPGATE_DB               SQLite database for READ_DB / WRITE_DB
    CAPGATE_TRANSFER_RPC     JSON-RPC endpoint for TOKEN_TRANSFER
    CAPGATE_TRANSFER_WALLET  Wallet identifier for TOKEN_TRANSFER

Commands are read from stdin, one per line; type /help once running.

EXAMPLES:
    capgate                               # uses config/capgate.toml
    capgate /etc/capgate/capgate.toml     # custom config path
    RUST_LOG=debug capgate                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("capgate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Logs go to stderr so stdout carries only console JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/capgate.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load configuration from {config_path}"))?;

    info!("Agent: {} (scope {})", config.sandbox.agent_id, config.sandbox.scope);
    info!("Sandbox root: {}", config.providers.root.display());
    if config.providers.process.allowlist.is_empty() {
        info!("Process allow-list: empty (SPAWN_PROCESS unavailable)");
    } else {
        info!(
            "Process allow-list: {}",
            config.providers.process.allowlist.join(", ")
        );
    }
    if present(&config.providers.store.connection).is_none() {
        info!("Store: not configured");
    }
    if !config.capabilities.is_empty() {
        info!(
            "Capability packs: {}",
            config.capabilities.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    tokio::fs::create_dir_all(&config.providers.root)
        .await
        .with_context(|| {
            format!(
                "cannot create sandbox root {}",
                config.providers.root.display()
            )
        })?;

    let sandbox = Arc::new(Sandbox::from_config(&config));
    let console = Console::new(Arc::clone(&sandbox));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!("Ready; type /help for commands");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        };

        let Some(line) = line else {
            info!("End of input, exiting");
            break;
        };

        match console.handle(&line).await {
            Reply::Output(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Reply::Silent => {}
            Reply::Quit => break,
        }
    }

    let pending = sandbox.status().pending_approvals;
    if pending > 0 {
        warn!("{pending} review item(s) still pending; the in-memory queue is discarded on exit");
    }

    Ok(())
}
