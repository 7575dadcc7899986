//! Relay Daemon - Stateful Chat-Completion Relay
//!
//! Entry point for the relay process. `run` keeps the relay resident:
//! credentials and sessions are restored from the data directory, swept
//! periodically, and flushed on shutdown. The other subcommands are one-shot
//! operator tools over the same persisted state.
//!
//! # Usage
//!
//! ```bash
//! # Run resident with defaults
//! relay-daemon run
//!
//! # With config file
//! relay-daemon --config /etc/chat-relay/relay.toml run
//!
//! # Ask a question, then continue the conversation
//! relay-daemon chat "What is a share link?"
//! relay-daemon chat --conversation <handle> "And how is it cloned?"
//!
//! # Manage credentials
//! relay-daemon credentials add <secret> --name main --tier super
//! relay-daemon credentials list
//!
//! # Try everything without reaching upstream
//! relay-daemon --offline chat "hello"
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon run
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (state is flushed)
//! - `SIGHUP`: Reload credential seeds from the config file

mod commands;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

use relay_core::{
    load_config_from_path, ConfigOverrides, MemoryStore, RelayConfig, RequestOrchestrator,
    ScriptedUpstream, Tier,
};

/// Relay Daemon - stateful chat-completion relay over a pooled upstream
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    /// Upstream base URL
    #[arg(long, value_name = "URL", global = true)]
    base_url: Option<String>,

    /// HTTP(S)/SOCKS proxy for upstream calls
    #[arg(long, value_name = "URL", global = true)]
    proxy: Option<String>,

    /// Data directory for credentials and sessions
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Answer from an in-process scripted upstream and keep state in memory
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run resident until signalled (default)
    Run {
        /// PID file path
        #[arg(long, env = "RELAY_PID_FILE", value_name = "PATH")]
        pid_file: Option<PathBuf>,
    },
    /// Send one chat turn
    Chat(ChatArgs),
    /// List the model registry
    Models,
    /// Manage the credential pool
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

/// Options for one chat turn
#[derive(ClapArgs, Debug)]
pub struct ChatArgs {
    /// User message
    message: String,

    /// Model id
    #[arg(short = 'm', long, default_value = "grok-3")]
    model: String,

    /// System prompt for a new conversation
    #[arg(short = 's', long)]
    system: Option<String>,

    /// Continue the conversation with this handle
    #[arg(long, value_name = "HANDLE")]
    conversation: Option<String>,

    /// Print fragments as they arrive
    #[arg(long)]
    stream: bool,

    /// With --stream, print raw server-sent events
    #[arg(long, requires = "stream")]
    sse: bool,
}

#[derive(Subcommand, Debug)]
enum CredentialAction {
    /// Show every credential and its health
    List,
    /// Add a credential
    Add {
        /// Secret, raw or in cookie form
        secret: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
        /// Account tier (free, super, unknown)
        #[arg(long, default_value = "unknown", value_parser = parse_tier)]
        tier: Tier,
    },
    /// Remove a credential
    Remove {
        /// Credential id
        id: String,
    },
    /// Re-enable a credential and clear its cooldown
    Enable {
        /// Credential id
        id: String,
    },
    /// Disable a credential until re-enabled
    Disable {
        /// Credential id
        id: String,
    },
    /// Ask upstream for a credential's quota and tier
    Check {
        /// Credential id
        id: String,
    },
    /// Re-read quota and tier for every enabled credential
    Refresh,
}

fn parse_tier(s: &str) -> Result<Tier, String> {
    Tier::parse(s).ok_or_else(|| format!("unknown tier {s:?} (expected free, super or unknown)"))
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Load the config file and environment, then apply command-line overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(relay_core::default_config_path);
    let mut config = load_config_from_path(path).context("failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(url) = &args.base_url {
        overrides = overrides.with_base_url(url.clone());
    }
    if let Some(proxy) = &args.proxy {
        overrides = overrides.with_proxy_url(proxy.clone());
    }
    if let Some(dir) = &args.data_dir {
        overrides = overrides.with_data_dir(dir.clone());
    }
    overrides.apply(&mut config);
    config
        .validate()
        .context("invalid command-line overrides")?;
    Ok(config)
}

fn build_relay(config: RelayConfig, offline: bool) -> Result<RequestOrchestrator> {
    let mut builder = RequestOrchestrator::builder(config);
    if offline {
        info!("Offline mode: scripted upstream, in-memory state");
        builder = builder
            .upstream(Arc::new(ScriptedUpstream::new()))
            .state_store(Arc::new(MemoryStore::new()));
    }
    builder.build().context("failed to build relay")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = resolve_config(&args)?;
    info!(
        source = %config.source(),
        base_url = %config.upstream.base_url,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );
    let relay = build_relay(config, args.offline)?;

    match args.command.unwrap_or(Command::Run { pid_file: None }) {
        Command::Run { pid_file } => {
            info!("Relay daemon starting");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));
            info!("PID: {}", std::process::id());
            let pid_path = pid_file.unwrap_or_else(service::default_pid_path);
            let config_path = args.config.or_else(relay_core::default_config_path);
            service::run(relay, config_path, pid_path).await
        }
        Command::Chat(chat) => commands::chat(&relay, chat).await,
        Command::Models => commands::models(&relay),
        Command::Credentials { action } => commands::credentials(&relay, action).await,
    }
}
