use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use envsentry::config::{LogFormat, LoggingConfig, PipelineConfig};

#[derive(Parser)]
#[command(
    name = "envsentry",
    about = "Streaming validation and anomaly detection for environmental sensors",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (pipeline + API server + background sweep/retrain)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// Config file (defaults to $ENVSENTRY_CONFIG, then /etc/envsentry/envsentry.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also read NDJSON readings from this file ("-" for stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Run a recorded NDJSON stream through the pipeline and print events
    Replay {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// NDJSON input ("-" for stdin)
        #[arg(long)]
        input: PathBuf,

        /// Resolve alerts still quiet at the end of the recording
        #[arg(long)]
        resolve: bool,

        /// Print alert transitions only, not every cleaned reading
        #[arg(long)]
        alerts_only: bool,
    },

    /// Parse and validate a config file, then print the effective config
    CheckConfig {
        /// Config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::load(p),
        None => PipelineConfig::load_or_default(),
    }
}

/// Logs go to stderr so stdout stays a clean event stream.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, config, input } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging);
            tracing::info!(%bind, "Starting EnvSentry daemon");
            envsentry::serve(config, &bind, input.as_deref()).await?;
        }
        Commands::Replay {
            config,
            input,
            resolve,
            alerts_only,
        } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging);
            let report = envsentry::replay(config, &input, resolve, alerts_only).await?;
            tracing::info!(
                lines = report.feed.lines,
                accepted = report.quality.accepted,
                rejected = report.quality.rejected(),
                alerts = report.sinks.alerts,
                resolved_at_end = report.resolved_at_end,
                "Replay finished"
            );
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&config)?);
            eprintln!("Configuration OK");
        }
    }

    Ok(())
}
