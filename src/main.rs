//! Backtester entry point
//!
//! This binary provides two subcommands:
//! - run: Execute a backtest from a JSON configuration file
//! - download: Download historical bars to CSV for offline runs

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "equity-backtester")]
#[command(about = "Bar-by-bar multi-asset backtesting engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a backtest
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: String,

        /// Initial capital (overrides config file)
        #[arg(long)]
        capital: Option<f64>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Read bars from CSV files in this directory instead of the remote provider
        #[arg(long)]
        data_dir: Option<String>,

        /// Write the full result record as JSON to this path
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Download historical bars to CSV
    Download {
        /// Tickers to download (comma-separated). E.g., "AAPL,MSFT,GOOG"
        #[arg(short, long)]
        tickers: String,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        output: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Download { .. } => "download",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            capital,
            start,
            end,
            data_dir,
            output,
        } => commands::run::run(config, capital, start, end, data_dir, output).await,

        Commands::Download {
            tickers,
            start,
            end,
            output,
        } => commands::download::run(tickers, start, end, output).await,
    }
}
