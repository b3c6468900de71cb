mod commands;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use config::{AppConfig, ConfigStore};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

const API_URL_ENV: &str = "MINDMAP_API_URL";

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.push("mindmap");
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let config_store = ConfigStore::from_dir(data_dir.join("config"));
    let mut config = match config_store.load_or_init() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            AppConfig::default()
        }
    };
    apply_overrides(&mut config, cli.api_url.clone());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::run(cli, config, &data_dir)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Command line flag first, then the environment, then the config file.
fn apply_overrides(config: &mut AppConfig, flag: Option<String>) {
    let env = std::env::var(API_URL_ENV).ok();
    if let Some(base_url) = flag.or(env).filter(|url| !url.trim().is_empty()) {
        config.api.base_url = base_url.trim().trim_end_matches('/').to_string();
    }
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "mindmap.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
