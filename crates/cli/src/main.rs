//! codeloom CLI: the main entry point.
//!
//! Commands:
//! - `run`       : chat with the coding agent, or answer one prompt
//! - `sessions`  : list, show or delete stored sessions
//! - `models`    : show the model catalog
//! - `config`    : show, locate or initialize the configuration

use clap::{Parser, Subcommand};
use codeloom::App;
use codeloom::commands::{self, run::RunArgs};
use codeloom_config::{AppConfig, LoggingConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codeloom", about = "A coding assistant for your terminal", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.codeloom/config.toml)
    #[arg(short, long, global = true, env = "CODELOOM_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent; with a prompt, answer it and exit
    Run {
        prompt: Option<String>,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,

        /// Model for this session's coder turns
        #[arg(short, long)]
        model: Option<String>,

        /// Allow every tool call without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        action: Option<SessionAction>,
    },

    /// List catalog models; ✓ marks models with a configured provider
    Models {
        /// Ask each provider which models it offers
        #[arg(long)]
        check: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    List,
    Show { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with keys masked
    Show,
    /// Print the configuration file path
    Path,
    /// Write a default configuration file
    Init,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let default = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"));

    if let Commands::Config { action: ConfigAction::Init } = &cli.command {
        commands::config_cmd::init(&config_path)?;
        return Ok(());
    }
    if let Commands::Config { action: ConfigAction::Path } = &cli.command {
        commands::config_cmd::path(&config_path);
        return Ok(());
    }

    let config = AppConfig::load_with_env(&config_path)
        .map_err(|e| format!("Failed to load config: {e}"))?;
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Config { .. } => commands::config_cmd::show(&config)?,
        Commands::Run {
            prompt,
            session,
            model,
            yes,
        } => {
            let app = App::build(config).await?;
            commands::run::run(
                app,
                RunArgs {
                    prompt,
                    session,
                    model,
                    yes,
                },
            )
            .await?
        }
        Commands::Sessions { action } => {
            let app = App::build(config).await?;
            match action.unwrap_or(SessionAction::List) {
                SessionAction::List => commands::sessions::list(&app).await?,
                SessionAction::Show { id } => commands::sessions::show(&app, &id).await?,
                SessionAction::Delete { id } => commands::sessions::delete(&app, &id).await?,
            }
        }
        Commands::Models { check } => {
            let app = App::build(config).await?;
            commands::models::list(&app, check).await?;
        }
    }

    Ok(())
}
