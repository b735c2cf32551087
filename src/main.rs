use std::{fs::OpenOptions, path::PathBuf, process::ExitCode};

use clap::Parser;
use log::{error, info};

use pykit_tasks::app::{cli, context::AppContext};
use pykit_tasks::config::{self, AppConfig, LoggingConfig};

const DEFAULT_CONFIG: &str = "pykit.toml";

/// Terminal front-end for managing Python packages and freezing scripts
#[derive(Parser)]
#[command(name = "pykit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file, TOML or JSON
    #[arg(value_name = "CONFIG", conflicts_with = "config")]
    config_file: Option<PathBuf>,

    /// Configuration file (same as the positional argument)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print a sample configuration and exit
    #[arg(long)]
    sample_config: bool,
}

fn init_logging(logging: &LoggingConfig) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(logging.level_filter())
        .format_timestamp_secs()
        // RUST_LOG wins over the config file
        .parse_default_env();

    if let Some(path) = &logging.file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}, logging to stderr.", path.display(), e),
        }
    }
    builder.init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.sample_config {
        print!("{}", config::generate_sample());
        return ExitCode::SUCCESS;
    }
    let config_path = cli
        .config_file
        .or(cli.config)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config: AppConfig = match config::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging);
    info!("Configuration loaded from {}.", config_path.display());

    let app = AppContext::from_config(config).with_config_path(config_path);
    if let Err(e) = cli::run_cli(app) {
        error!("Terminal error: {}", e);
        eprintln!("Terminal error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
