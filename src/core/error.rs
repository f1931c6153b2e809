//! Error types for terratile

use thiserror::Error;

use crate::tile::key::KeyError;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Tile key error: {0}")]
    Key(#[from] KeyError),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
