//! padflash - grid controller firmware patcher and MIDI flasher
//!
//! Builds customized firmware images from a local catalog, identifies
//! uploaded images, and flashes them over SysEx.

mod commands;
mod config;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use padflash_core::Model;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::commands::FlashSource;

#[derive(Parser, Debug)]
#[command(name = "padflash")]
#[command(about = "Patch and flash firmware for MIDI grid controllers")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "padflash.toml")]
    config: PathBuf,

    /// Firmware catalog manifest (overrides the configuration)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the models in the firmware catalog
    Models,

    /// Build a patched firmware image
    Patch {
        /// Model short name, e.g. LPX or MF64
        #[arg(short, long)]
        model: Model,
        /// Enable a patch option (repeatable)
        #[arg(long = "option")]
        options: Vec<String>,
        /// JSON palette file
        #[arg(long)]
        palette: Option<PathBuf>,
        /// Output file (defaults to the image's download name)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the unencoded payload
        #[arg(long)]
        raw: bool,
    },

    /// Identify a firmware file
    Verify { file: PathBuf },

    /// Patch (or load) an image and flash it over MIDI
    Flash {
        #[arg(short, long, required_unless_present = "file", conflicts_with = "file")]
        model: Option<Model>,
        #[arg(long = "option")]
        options: Vec<String>,
        #[arg(long)]
        palette: Option<PathBuf>,
        /// Flash a previously built or downloaded image instead
        #[arg(long)]
        file: Option<PathBuf>,
        /// Output port name (overrides the configuration)
        #[arg(short, long)]
        port: Option<String>,
    },

    /// List MIDI ports
    Ports,

    /// Write a default configuration file
    InitConfig { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("padflash v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(catalog) = args.catalog {
        config.catalog.manifest = catalog;
    }

    match args.command {
        Command::Models => {
            let catalog = commands::load_catalog(&config)?;
            commands::models(&catalog);
        }
        Command::Patch {
            model,
            options,
            palette,
            output,
            raw,
        } => {
            let catalog = commands::load_catalog(&config)?;
            commands::patch_to_file(&catalog, model, &options, palette.as_deref(), output, raw)?;
        }
        Command::Verify { file } => {
            let catalog = commands::load_catalog(&config)?;
            let model = commands::verify_file(&catalog, &file)?;
            println!("{} ({})", model.name(), model.display_name());
        }
        Command::Flash {
            model,
            options,
            palette,
            file,
            port,
        } => {
            let source = match (model, file) {
                (_, Some(file)) => FlashSource::Upload(file),
                (Some(model), None) => FlashSource::Patch {
                    model,
                    options,
                    palette,
                },
                (None, None) => bail!("Either --model or --file is required"),
            };
            let catalog = commands::load_catalog(&config)?;
            commands::flash(&config, &catalog, source, port).await?;
        }
        Command::Ports => commands::ports()?,
        Command::InitConfig { path } => {
            let path = path.unwrap_or(args.config);
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            config::save_default_config(&path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}
