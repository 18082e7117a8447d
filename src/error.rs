//! Error types for burn-distill.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A MNIST IDX file with an unexpected header or size.
    #[error("Invalid IDX file {path:?}: {reason}")]
    InvalidIdx {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] burn::config::ConfigError),

    #[error("Record error: {0}")]
    Record(#[from] burn::record::RecorderError),

    #[error("Argument error: {0}")]
    Args(#[from] pico_args::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
