use anyhow::Result;
use clap::{Parser, Subcommand};
use runpad_cli::commands::{self, LocalRun};
use runpad_cli::{logging, server, AppConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "runpad")]
#[command(about = "Run generated projects in disposable workspaces")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: <config dir>/runpad/config.toml)
    #[arg(long, global = true, env = "RUNPAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service (default if no subcommand provided)
    Serve {
        /// Address to listen on, overrides the config file
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Execute a local project directory
    Run {
        /// Project directory
        dir: PathBuf,

        /// Entry file relative to the project (default: main.py)
        #[arg(short, long)]
        entry: Option<String>,

        /// Wall-clock limit such as "10s" or "2m", capped by the config
        #[arg(short, long, value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Write the produced image to this path
        #[arg(long)]
        image_out: Option<PathBuf>,

        /// Print the result as JSON instead of streaming output
        #[arg(long)]
        json: bool,

        /// Abort if dependency installation fails
        #[arg(long)]
        fail_fast: bool,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Serve { bind }) => {
            let mut config = AppConfig::load(cli.config.as_deref())?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            run_server(config, cli.verbose).await
        }
        Some(Commands::Run {
            dir,
            entry,
            timeout,
            image_out,
            json,
            fail_fast,
        }) => {
            let config = AppConfig::load(cli.config.as_deref())?;
            let options = LocalRun {
                dir,
                entry,
                timeout,
                image_out,
                json,
                fail_fast,
            };
            let code = run_local(config, options, cli.verbose).await?;
            return Ok(ExitCode::from(exit_status(code)));
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Show => {
                let config = AppConfig::load(cli.config.as_deref())?;
                commands::show_config(&config)
            }
            ConfigAction::Init { force } => {
                let path = commands::config_file(cli.config.as_deref())?;
                commands::init_config(&path, force)
            }
            ConfigAction::Path => {
                let path = commands::config_file(cli.config.as_deref())?;
                println!("{}", path.display());
                Ok(())
            }
        },
        None => {
            // Default to serve
            let config = AppConfig::load(cli.config.as_deref())?;
            run_server(config, cli.verbose).await
        }
    };
    outcome.map(|()| ExitCode::SUCCESS)
}

/// Run a local project; the log writer is flushed before this returns
async fn run_local(config: AppConfig, options: LocalRun, verbose: u8) -> Result<i32> {
    let level = logging::level_for("warn", verbose);
    let _guard = logging::init(&level, config.logging.file.as_deref())?;
    commands::run_project(&config, options).await
}

/// Process exit status for a program exit code; out of range means failure
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn run_server(config: AppConfig, verbose: u8) -> Result<()> {
    let level = logging::level_for(&config.logging.level, verbose);
    let _guard = logging::init(&level, config.logging.file.as_deref())?;
    server::serve(&config).await
}
