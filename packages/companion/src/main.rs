use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::prelude::*;

use companion_core::{
    ClientFileConfig, CompanionDirs, ConnectionConfig, FileStore, MessageQueue, Profile,
    ServerConfig, SyncConfig, load_config,
};

mod commands;

#[derive(Parser)]
#[command(name = "companion")]
#[command(about = "Follow and drive remote coding-agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.companion)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Connection profile (mobile gives up after a few reconnects, desktop never does)
    #[arg(long, global = true)]
    profile: Option<Profile>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to every configured server and report its state
    Status(StatusArgs),

    /// Follow a session transcript; lines typed on stdin are sent as input
    Watch(WatchArgs),

    /// Inspect or edit the offline message queue
    #[command(subcommand)]
    Queue(QueueCommand),
}

#[derive(Parser)]
struct StatusArgs {
    /// Seconds to wait for connections to settle
    #[arg(long, default_value = "5")]
    wait: u64,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct WatchArgs {
    /// Server ID from config.toml
    server: String,

    /// Session to follow
    session: String,
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List queued messages
    List {
        /// Only show messages for this server
        #[arg(long)]
        server: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue a message for later delivery
    Add {
        server: String,
        text: String,
        /// Target session (defaults to the daemon's current one)
        #[arg(long)]
        session: Option<String>,
    },
    /// Replace the text of a queued message
    Edit { id: String, text: String },
    /// Remove one queued message
    Cancel { id: String },
    /// Remove every queued message for a server
    Clear { server: String },
    /// Connect to a server and deliver its queued messages
    Flush {
        server: String,
        /// Seconds to wait for delivery
        #[arg(long, default_value = "10")]
        wait: u64,
    },
}

/// Everything a command needs, resolved from flags, config.toml and env.
pub(crate) struct AppContext {
    pub dirs: CompanionDirs,
    pub servers: Vec<ServerConfig>,
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub queue: MessageQueue,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let dirs = CompanionDirs::new(cli.data_dir.clone())
            .context("Failed to prepare data directory")?;
        let file_config: ClientFileConfig = load_config(&dirs.data_dir, cli.profile.as_ref())
            .extract()
            .with_context(|| format!("Invalid config in {}", dirs.config_toml_path().display()))?;
        debug!(
            profile = ?file_config.profile,
            servers = file_config.servers.len(),
            "Loaded config"
        );

        let store = FileStore::open(dirs.store_dir.clone()).context("Failed to open message store")?;
        let queue = MessageQueue::load(Arc::new(store)).context("Failed to load message queue")?;

        Ok(Self {
            servers: file_config.servers,
            connection: ConnectionConfig::from_file(&file_config.connection),
            sync: SyncConfig::from_file(&file_config.sync),
            queue,
            dirs,
        })
    }

    pub fn find_server(&self, server_id: &str) -> Result<ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .with_context(|| {
                format!(
                    "No server '{server_id}' in {}",
                    self.dirs.config_toml_path().display()
                )
            })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `--json` output stays clean.
    let default_directive = if cli.debug {
        "companion=debug,companion_core=debug,warn"
    } else {
        "companion=info,companion_core=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let ctx = AppContext::load(&cli)?;

    match cli.command {
        Commands::Status(args) => {
            commands::status_command(&ctx, Duration::from_secs(args.wait), args.json).await
        }
        Commands::Watch(args) => commands::watch_command(&ctx, &args.server, &args.session).await,
        Commands::Queue(QueueCommand::List { server, json }) => {
            commands::queue_list(&ctx, server.as_deref(), json)
        }
        Commands::Queue(QueueCommand::Add {
            server,
            text,
            session,
        }) => commands::queue_add(&ctx, &server, &text, session.as_deref()),
        Commands::Queue(QueueCommand::Edit { id, text }) => commands::queue_edit(&ctx, &id, &text),
        Commands::Queue(QueueCommand::Cancel { id }) => commands::queue_cancel(&ctx, &id),
        Commands::Queue(QueueCommand::Clear { server }) => commands::queue_clear(&ctx, &server),
        Commands::Queue(QueueCommand::Flush { server, wait }) => {
            commands::queue_flush(&ctx, &server, Duration::from_secs(wait)).await
        }
    }
}
