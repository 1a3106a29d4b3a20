// src/logging.rs

//! Tracing setup for the binary. Stdout carries the JSON report, so log
//! lines go to stderr and, when the data directory is writable, to a file.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use color_eyre::eyre::Result;
use directories::ProjectDirs;
use lazy_static::lazy_static;
use time::macros::format_description;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

lazy_static! {
    /// Consulted when `RUST_LOG` is unset, e.g. `VANGUARD_BP_SCANNER_LOGLEVEL=debug`.
    static ref LEVEL_VAR: String =
        format!("{}_LOGLEVEL", env!("CARGO_CRATE_NAME").to_uppercase());
    static ref LOG_DIRECTORY: PathBuf =
        ProjectDirs::from("com", "vanguard-bp", env!("CARGO_PKG_NAME"))
            .map(|dirs| dirs.data_local_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from(".data").join("logs"));
}

pub fn log_file_path() -> PathBuf {
    LOG_DIRECTORY.join(format!("{}.log", env!("CARGO_PKG_NAME")))
}

/// `RUST_LOG` wins over the crate variable; without either only this crate
/// logs, at info.
fn filter_directive(rust_log: Option<String>, crate_level: Option<String>) -> String {
    rust_log
        .or(crate_level)
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| format!("{}=info", env!("CARGO_CRATE_NAME")))
}

fn env_filter() -> EnvFilter {
    EnvFilter::new(filter_directive(
        std::env::var("RUST_LOG").ok(),
        std::env::var(LEVEL_VAR.as_str()).ok(),
    ))
}

fn open_log_file() -> std::io::Result<File> {
    std::fs::create_dir_all(LOG_DIRECTORY.as_path())?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path())
}

pub fn initialize_logging() -> Result<()> {
    let timer = LocalTime::new(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));

    let (file_layer, file_error) = match open_log_file() {
        Ok(file) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(file)
                .with_timer(timer.clone())
                .with_target(false)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), None)
        }
        Err(e) => (None, Some(e)),
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(timer)
        .with_target(false)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(ErrorLayer::default())
        .try_init()?;

    if let Some(e) = file_error {
        tracing::warn!(
            path = %log_file_path().display(),
            error = %e,
            "Could not open the log file, logging to stderr only."
        );
    }
    Ok(())
}
