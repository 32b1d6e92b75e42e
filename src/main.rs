//! CPR Stream Agent CLI
//!
//! Live classification of chest-compression depth streams.

use clap::{Parser, Subcommand};
#[cfg(feature = "server")]
use cpr_stream_agent::config::parse_origins;
use cpr_stream_agent::{
    ClassLabels, Config, InferenceDispatcher, LinearModel, ScalerParams, VERSION, WINDOW_SIZE,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpr-agent")]
#[command(version = VERSION)]
#[command(about = "Streaming CPR compression-depth classifier", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server
    #[cfg(feature = "server")]
    Serve {
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long)]
        port: Option<u16>,

        /// Classifier artifact
        #[arg(long)]
        model: Option<PathBuf>,

        /// Calibration parameters (mean/scale)
        #[arg(long)]
        scaler: Option<PathBuf>,

        /// Allowed CORS origins, comma-separated or "*"
        #[arg(long)]
        cors: Option<String>,
    },

    /// Classify one window of depths offline
    Classify {
        /// Exactly ten depth values in centimeters
        #[arg(required = true, num_args = WINDOW_SIZE, allow_negative_numbers = true)]
        depths: Vec<f32>,

        /// Classifier artifact
        #[arg(long)]
        model: Option<PathBuf>,

        /// Calibration parameters (mean/scale)
        #[arg(long)]
        scaler: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    config.apply_env();

    let result = match cli.command {
        #[cfg(feature = "server")]
        Commands::Serve {
            host,
            port,
            model,
            scaler,
            cors,
        } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(cors) = cors {
                config.cors_origins = parse_origins(&cors);
            }
            apply_model_flags(&mut config, model, scaler);
            cmd_serve(config)
        }
        Commands::Classify {
            depths,
            model,
            scaler,
        } => {
            apply_model_flags(&mut config, model, scaler);
            cmd_classify(&config, &depths)
        }
        Commands::Config => cmd_config(&config, cli.config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_model_flags(config: &mut Config, model: Option<PathBuf>, scaler: Option<PathBuf>) {
    if let Some(model) = model {
        config.model_path = model;
    }
    if let Some(scaler) = scaler {
        config.scaler_path = Some(scaler);
    }
}

#[cfg(feature = "server")]
fn cmd_serve(config: Config) -> anyhow::Result<()> {
    // Missing or invalid calibration/model is fatal before binding.
    let engine = cpr_stream_agent::StreamEngine::from_config(&config)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let (addr, shutdown_tx) = cpr_stream_agent::server::run(config, engine).await?;
        println!("CPR Stream Agent v{VERSION} reachable at http://{addr}");
        println!("Press Ctrl+C to stop");

        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(());
        // Let in-flight requests drain
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_classify(config: &Config, depths: &[f32]) -> anyhow::Result<()> {
    let scaler = ScalerParams::load(&config.resolved_scaler_path())?;
    let model = LinearModel::load(&config.model_path)?;
    let labels = ClassLabels::new(config.class_labels.clone())?;

    let dispatcher = InferenceDispatcher::new(Arc::new(model), scaler, labels);
    let result = dispatcher.infer(depths)?;

    println!("Label: {} (class {})", result.class_label, result.class_index);
    for (i, p) in result.probs.iter().enumerate() {
        println!("  {:<16} {:.4}", dispatcher.labels().label(i), p);
    }
    Ok(())
}

fn cmd_config(config: &Config, explicit: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!(
        "Config file: {:?}",
        explicit.unwrap_or_else(Config::config_path)
    );
    println!("Calibration: {:?}", config.resolved_scaler_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
