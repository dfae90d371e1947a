//! avsctl - local control plane for AVS node packages

mod commands;

use clap::{Parser, Subcommand};
use avsctl_config::GlobalConfig;
use avsctl_core::NodeManager;
use avsctl_provider::connect_runtime;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "avsctl")]
#[command(author, version, about = "Local control plane for AVS node packages", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install an AVS package from a repository URL
    Install {
        /// Package repository URL
        url: String,
        /// Version tag to install (defaults to the latest)
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Profile to deploy
        #[arg(short, long)]
        profile: Option<String>,
        /// Instance tag
        #[arg(short, long, default_value = "default")]
        tag: String,
        /// Never ask questions; fail instead
        #[arg(long)]
        no_prompt: bool,
        /// Assume yes on confirmations
        #[arg(short = 'y', long)]
        yes: bool,
        /// Start the instance after installing
        #[arg(long)]
        run: bool,
        /// Option value as name=value (repeatable)
        #[arg(short = 'o', long = "option", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },

    /// Install an AVS package from a local directory
    LocalInstall {
        /// Package directory
        path: PathBuf,
        /// Instance name (defaults to the manifest name)
        #[arg(long)]
        name: Option<String>,
        /// Profile to deploy
        #[arg(short, long)]
        profile: Option<String>,
        /// Instance tag
        #[arg(short, long, default_value = "default")]
        tag: String,
        /// Option value as name=value (repeatable)
        #[arg(short = 'o', long = "option", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },

    /// Update an installed instance to a new version or commit
    Update {
        /// Instance id
        instance_id: String,
        /// Target version tag or commit (defaults to the latest version)
        reference: Option<String>,
        /// Back up the instance first and restore it if the update fails
        #[arg(long)]
        backup: bool,
        /// Never ask questions; fail instead
        #[arg(long)]
        no_prompt: bool,
        /// Assume yes on confirmations
        #[arg(short = 'y', long)]
        yes: bool,
        /// Start the instance after updating
        #[arg(long)]
        run: bool,
        /// Option value as name=value (repeatable)
        #[arg(short = 'o', long = "option", value_parser = parse_key_val)]
        options: Vec<(String, String)>,
    },

    /// List installed instances
    Ls,

    /// Stream an instance's merged service logs
    Logs {
        /// Instance id
        instance_id: String,
        /// Follow log output
        #[arg(short, long)]
        follow: bool,
        /// Show logs since this time (unix timestamp or RFC 3339)
        #[arg(long)]
        since: Option<String>,
        /// Show logs until this time (unix timestamp or RFC 3339)
        #[arg(long)]
        until: Option<String>,
        /// Show timestamps
        #[arg(short = 't', long)]
        timestamps: bool,
        /// Number of lines from the end of each service's log
        #[arg(short = 'n', long)]
        tail: Option<String>,
    },

    /// Run an instance's plugin
    Plugin {
        /// Run on the host network
        #[arg(long)]
        host: bool,
        /// Keep the plugin image after the run
        #[arg(long)]
        no_rm_image: bool,
        /// Bind mount as src:dst (repeatable)
        #[arg(short = 'v', long = "volume")]
        volumes: Vec<String>,
        /// Instance id
        instance_id: String,
        /// Arguments passed to the plugin
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Back up an instance (`backup <id>`), or list backups (`backup ls`)
    Backup {
        /// Instance id, or `ls` to list existing backups
        target: String,
    },

    /// Restore an instance from a backup
    Restore {
        /// Backup id
        backup_id: String,
        /// Start the instance after restoring
        #[arg(long)]
        run: bool,
    },

    /// Start an installed instance
    Run {
        /// Instance id
        instance_id: String,
    },

    /// Stop a running instance
    Stop {
        /// Instance id
        instance_id: String,
    },

    /// Uninstall an instance
    Uninstall {
        /// Instance id
        instance_id: String,
    },

    /// Install and start the monitoring stack
    InitMonitoring,

    /// Tear the monitoring stack down
    CleanMonitoring,
}

/// Parse a `name=value` option argument
fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("'{}' is not a name=value pair", raw)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = GlobalConfig::load().unwrap_or_default();

    let manager = match connect_runtime(&config).await {
        Ok(runtime) => NodeManager::new(runtime, config)?,
        Err(e) => {
            tracing::debug!("runtime unavailable: {}", e);
            NodeManager::disconnected(config, e.to_string())?
        }
    };

    match cli.command {
        Commands::Install {
            url,
            version,
            profile,
            tag,
            no_prompt: _,
            yes: _,
            run,
            options,
        } => {
            commands::install(&manager, &url, version, profile, &tag, run, options).await?;
        }
        Commands::LocalInstall {
            path,
            name,
            profile,
            tag,
            options,
        } => {
            commands::local_install(&manager, path, name, profile, &tag, options).await?;
        }
        Commands::Update {
            instance_id,
            reference,
            backup,
            no_prompt: _,
            yes: _,
            run,
            options,
        } => {
            commands::update(&manager, &instance_id, reference, backup, run, options).await?;
        }
        Commands::Ls => {
            commands::ls(&manager).await?;
        }
        Commands::Logs {
            instance_id,
            follow,
            since,
            until,
            timestamps,
            tail,
        } => {
            commands::logs(&manager, &instance_id, follow, since, until, timestamps, tail)
                .await?;
        }
        Commands::Plugin {
            host,
            no_rm_image,
            volumes,
            instance_id,
            args,
        } => {
            commands::plugin(&manager, &instance_id, args, host, no_rm_image, volumes).await?;
        }
        Commands::Backup { target } => {
            if target == "ls" {
                commands::backup_ls(&manager)?;
            } else {
                commands::backup(&manager, &target).await?;
            }
        }
        Commands::Restore { backup_id, run } => {
            commands::restore(&manager, &backup_id, run).await?;
        }
        Commands::Run { instance_id } => {
            commands::run(&manager, &instance_id).await?;
        }
        Commands::Stop { instance_id } => {
            commands::stop(&manager, &instance_id).await?;
        }
        Commands::Uninstall { instance_id } => {
            commands::uninstall(&manager, &instance_id).await?;
        }
        Commands::InitMonitoring => {
            commands::init_monitoring(&manager).await?;
        }
        Commands::CleanMonitoring => {
            commands::clean_monitoring(&manager).await?;
        }
    }

    Ok(())
}
