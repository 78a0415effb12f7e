use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use peervault::config::Config;

#[derive(Parser)]
#[command(name = "peervault")]
#[command(about = "Peer-to-peer content-addressed encrypted file storage", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Serve {
        /// Configuration file path
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,

        /// Override the listen address
        #[arg(long)]
        listen: Option<String>,

        /// Override the storage root directory
        #[arg(long)]
        storage: Option<String>,

        /// Comma-separated bootstrap node addresses
        #[arg(long)]
        bootstrap: Option<String>,
    },
    /// Run a three-node demonstration cluster on localhost
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            storage,
            bootstrap,
        } => {
            let mut cfg = Config::load(&config)?;
            if let Some(listen) = listen {
                cfg.listen_addr = listen;
            }
            if let Some(storage) = storage {
                cfg.storage_root = storage;
            }
            if let Some(bootstrap) = bootstrap {
                cfg.bootstrap_nodes = bootstrap
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            cfg.validate()?;

            let filter = if cli.verbose {
                log::LevelFilter::Debug
            } else {
                cfg.log_level_filter().unwrap_or(log::LevelFilter::Info)
            };
            init_logging(filter, cfg.log_file.as_deref())?;

            peervault::commands::serve::run(cfg).await?;
        }
        Commands::Demo => {
            let filter = if cli.verbose {
                log::LevelFilter::Debug
            } else {
                log::LevelFilter::Info
            };
            init_logging(filter, None)?;

            peervault::commands::demo::run().await?;
        }
    }

    Ok(())
}

fn init_logging(filter: log::LevelFilter, log_file: Option<&str>) -> Result<(), Box<dyn Error>> {
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(filter);
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
