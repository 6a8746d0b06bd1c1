//! KeyRelay — rotating credential relay.
//!
//! `keyrelay serve` polls a credential command, learns its rotation cadence,
//! and serves the current value over HTTP.
//!
//! `keyrelay fetch <provider>` is the client side: asks a relay endpoint for
//! a key and prints it to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use keyrelay::auth::AuthGuard;
use keyrelay::server::{AppState, Server};
use keyrelay::{AdaptivePoller, CommandSource, DynamicKeyConfig, RelayConfig, RemoteKeyFetcher};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.keyrelay/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the credential command and serve it over HTTP
    Serve {
        /// Listen address, overrides `server.bind`
        #[arg(long)]
        bind: Option<String>,
        /// Credential command, overrides `poller.command`
        #[arg(long)]
        command: Option<String>,
    },
    /// Fetch a key from a relay endpoint and print it
    Fetch {
        provider: String,
        /// Endpoint URL, overrides `dynamic_key.endpoint_url`
        #[arg(long)]
        endpoint: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "keyrelay=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    match path.map(Path::to_path_buf).or_else(RelayConfig::default_path) {
        Some(path) => RelayConfig::load(&path),
        None => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Serve { bind, command } => serve(config, bind, command).await,
        Command::Fetch { provider, endpoint } => fetch(config, &provider, endpoint).await,
    }
}

async fn serve(config: RelayConfig, bind: Option<String>, command: Option<String>) -> Result<()> {
    info!("🔑 KeyRelay v{}", env!("CARGO_PKG_VERSION"));

    let bind = bind.unwrap_or(config.server.bind);
    let command = command.unwrap_or(config.poller.command);

    // ── Auth Bootstrap ──────────────────────────────────────────────
    let auth = AuthGuard::bootstrap(
        config.server.auth_token.as_deref(),
        config.server.token_file.as_deref(),
    )
    .context("Failed to bootstrap auth")?;

    if let Some(path) = auth.as_ref().and_then(AuthGuard::token_file_path) {
        info!(token_file = %path.display(), "Clients must send the token as a bearer header");
    }

    // ── Poller ──────────────────────────────────────────────────────
    let source = Arc::new(CommandSource::new(
        command,
        Duration::from_secs(config.poller.command_timeout_seconds),
    ));
    let poller = Arc::new(
        AdaptivePoller::new(source)
            .with_error_backoff(Duration::from_secs(config.poller.error_backoff_seconds)),
    );
    let task = poller.start();

    // ── HTTP Server ─────────────────────────────────────────────────
    let state = AppState::new(
        Arc::clone(&poller),
        auth,
        config.server.rate_limit_per_minute,
    );

    let result = Server::new(bind, state).run(shutdown_signal()).await;

    poller.stop();
    if let Err(e) = task.join().await {
        error!(error = %e, "Poller task panicked");
    }
    info!("KeyRelay stopped");

    result
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

async fn fetch(config: RelayConfig, provider: &str, endpoint: Option<String>) -> Result<()> {
    let key_config = match (config.dynamic_key, endpoint) {
        (Some(mut cfg), Some(url)) => {
            cfg.endpoint_url = url;
            cfg
        }
        (Some(cfg), None) => cfg,
        (None, Some(url)) => DynamicKeyConfig::new(url),
        (None, None) => {
            anyhow::bail!("No endpoint: pass --endpoint or set dynamic_key.endpoint_url")
        }
    };

    let fetcher = RemoteKeyFetcher::new(key_config)?;
    let result = fetcher.fetch(provider).await;
    fetcher.close();

    let key = result.with_context(|| format!("Failed to fetch key for {}", provider))?;
    println!("{}", key);
    Ok(())
}
