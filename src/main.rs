mod cli;

use clap::{Parser, Subcommand};
use cli::config::ConfigCommand;
use cli::data::PrepareArgs;
use cli::deploy::{DeployArgs, PredictArgs};
use cli::train::TrainArgs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "labflow")]
#[command(version, about = "Dataset, experiment tracking and deployment pipeline for classifiers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./labflow.toml when present)
    #[arg(short, long, global = true, env = "LABFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Split raw X/y arrays into train/val/test .npy files
    Prepare(PrepareArgs),

    /// Upload a directory of prepared splits to the object store
    Upload {
        /// Directory to upload (defaults to storage.data_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Train classifiers under one parent run and register them
    Train(TrainArgs),

    /// Create or replace a named deployment
    Deploy(DeployArgs),

    /// Score rows against a deployed endpoint
    Predict(PredictArgs),

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter_layer = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else if cli.verbose {
        tracing_subscriber::EnvFilter::new("info")
    } else {
        tracing_subscriber::EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("labflow v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli::config_path(cli.config.as_deref());

    // `config init` must work before any config file exists
    if let Commands::Config {
        command: ConfigCommand::Init { force },
    } = cli.command
    {
        return cli::config::cmd_config(
            ConfigCommand::Init { force },
            &config_path,
            Default::default(),
        );
    }

    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Prepare(args) => {
            info!("Preparing splits from {:?} and {:?}", args.x, args.y);
            cli::data::cmd_prepare(&config, args)?;
        }
        Commands::Upload { dir } => {
            cli::data::cmd_upload(&config, dir)?;
        }
        Commands::Train(args) => {
            cli::train::cmd_train(&config, args)?;
        }
        Commands::Deploy(args) => {
            info!("Deploying {} as {}", args.model_uri, args.name);
            cli::deploy::cmd_deploy(&config, args)?;
        }
        Commands::Predict(args) => {
            cli::deploy::cmd_predict(&config, args)?;
        }
        Commands::Config { command } => {
            cli::config::cmd_config(command, &config_path, config)?;
        }
    }

    Ok(())
}
