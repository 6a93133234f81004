//! Command-line front end for the prompt rewriter

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reprompt_runtime::{Config, DeviceSpec, LogFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "reprompt")]
#[command(about = "Rewrite text-to-image prompts with a local vision-language model")]
#[command(version)]
struct Cli {
    /// Configuration file path (environment variables are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite one or more prompts
    Rewrite {
        /// Prompts to rewrite; read line by line from stdin when empty
        prompts: Vec<String>,
        /// Model directory or hub repository id
        #[arg(short, long)]
        model_path: Option<PathBuf>,
        /// Device the inputs are packed onto
        #[arg(short, long)]
        device: Option<DeviceSpec>,
        /// Override the system instruction
        #[arg(long)]
        system_prompt: Option<String>,
        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f64>,
        /// Keep weights resident instead of offloading between calls
        #[arg(long)]
        no_offload: bool,
        /// Emit one JSON object per prompt
        #[arg(long)]
        json: bool,
    },
    /// Show how the configured topology places pipeline components
    Topology {
        /// Components present in the pipeline (all when empty)
        #[arg(short, long, value_delimiter = ',')]
        components: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::from_env()?,
    };
    config.validate()?;
    init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Rewrite {
            prompts,
            model_path,
            device,
            system_prompt,
            temperature,
            no_offload,
            json,
        } => {
            let mut config = config;
            if let Some(path) = model_path {
                config.model.model_path = path;
            }
            if let Some(device) = device {
                config.generation.device = device;
            }
            if let Some(prompt) = system_prompt {
                config.generation.system_prompt = prompt;
            }
            if let Some(temperature) = temperature {
                config.generation.params.temperature = temperature;
            }
            if no_offload {
                config.model.enable_offloading = false;
            }
            commands::rewrite::run(config, prompts, json).await
        }
        Commands::Topology { components } => commands::topology::run(&config, &components),
    }
}

fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}
