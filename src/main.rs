#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use sessionvault::config::{Config, CONFIG_DIR_ENV};
use sessionvault::sessions;
use sessionvault::SessionCommands;
use tracing_subscriber::{fmt, EnvFilter};

/// `sessionvault` - conversation sessions, event logs and state.
#[derive(Parser, Debug)]
#[command(name = "sessionvault")]
#[command(version)]
#[command(about = "Inspect and manage stored conversation sessions.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show configuration and storage backend status
    Status,

    /// Manage sessions (list, show, events, create, delete)
    #[command(long_about = "\
Manage stored sessions.

List a user's sessions, inspect a session's state and event log, \
create sessions with initial state, and delete sessions with \
confirmation. The backend comes from [storage] in config.toml.

Examples:
  sessionvault sessions list --app chat --user alice
  sessionvault sessions show --app chat --user alice --id s1 --recent 5
  sessionvault sessions create --app chat --user alice --state '{\"lang\":\"en\"}'
  sessionvault sessions delete --app chat --user alice --id s1 --yes")]
    Sessions {
        #[command(subcommand)]
        session_command: SessionCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var(CONFIG_DIR_ENV, config_dir);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Status => {
            println!("sessionvault status");
            println!();
            println!("Version:     {}", env!("CARGO_PKG_VERSION"));
            println!("Config:      {}", config.config_path.display());
            println!("Backend:     {}", config.storage.backend);
            match config.storage.backend.as_str() {
                "sqlite" => {
                    println!("Database:    {}", config.resolved_sqlite_path().display());
                    println!("Busy wait:   {} ms", config.storage.busy_timeout_ms);
                }
                "remote" => {
                    println!(
                        "Endpoint:    {}",
                        config
                            .remote
                            .endpoint
                            .as_deref()
                            .unwrap_or("(none, in-memory fallback)")
                    );
                    println!(
                        "API key:     {}",
                        if config.remote.api_key.is_some() { "set" } else { "unset" }
                    );
                }
                _ => {}
            }
            println!("Op timeout:  {} s", config.storage.operation_timeout_secs);

            let service = sessions::create_session_service(&config).await?;
            println!("Service:     {} (ready)", service.name());
            Ok(())
        }

        Commands::Sessions { session_command } => {
            sessions::handle_session_command(session_command, &config).await
        }
    }
}
