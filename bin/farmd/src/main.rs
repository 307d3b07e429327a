mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "farmd")]
#[command(about = "Build and render farm agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Agent home directory (default ~/.farm)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent in the foreground
    Run {
        /// Exit once this process exits
        #[arg(long)]
        owner_pid: Option<u32>,

        /// Host to bind the network transport to (overrides transport.host)
        #[arg(long)]
        host: Option<String>,

        /// Port for the network transport (overrides transport.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Local socket path (overrides transport.localSocket)
        #[arg(long)]
        local_socket: Option<PathBuf>,

        /// Reserve this machine for farm work regardless of load
        #[arg(long)]
        dedicated: bool,
    },

    /// Show the running agent's status
    Status {
        /// Print the raw JSON reply
        #[arg(long)]
        json: bool,

        /// Agent address (socket path or host:port); defaults to the local socket
        #[arg(long)]
        address: Option<String>,
    },

    /// Ask the running agent to drain and exit
    Shutdown,

    /// Maintenance commands for the running agent
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Drop every unpinned cache entry
    CacheClear,
    /// Re-hash every cache entry and drop the corrupt ones
    CacheValidate,
    /// Move the cache to another directory
    CacheRelocate {
        /// Target directory
        dir: PathBuf,
    },
    /// Drain, then restart the agent process
    Restart,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let paths = match cli.home {
        Some(home) => farm_core::Paths::with_base(home),
        None => farm_core::Paths::new(),
    };

    match cli.command {
        Commands::Run {
            owner_pid,
            host,
            port,
            local_socket,
            dedicated,
        } => {
            let overrides = commands::run::Overrides {
                host,
                port,
                local_socket,
                dedicated,
            };
            commands::run::run(&paths, owner_pid, overrides).await?;
        }
        Commands::Status { json, address } => {
            commands::control::status(&paths, address, json).await?;
        }
        Commands::Shutdown => {
            commands::control::shutdown(&paths).await?;
        }
        Commands::Admin { command } => {
            let (method, params) = match command {
                AdminCommands::CacheClear => ("admin.cacheClear", serde_json::Value::Null),
                AdminCommands::CacheValidate => ("admin.cacheValidate", serde_json::Value::Null),
                AdminCommands::CacheRelocate { dir } => {
                    ("admin.cacheRelocate", serde_json::json!({ "path": dir }))
                }
                AdminCommands::Restart => ("admin.restart", serde_json::Value::Null),
            };
            commands::control::admin(&paths, method, params).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(&paths, force)?;
            }
            ConfigCommands::Show => {
                commands::config_cmd::show(&paths)?;
            }
        },
    }

    Ok(())
}
