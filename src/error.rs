// Error types for promptcanvas

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Image error: {0}")]
    Image(#[from] imagent::ImageGenError),

    #[error("Enhancement failed: {0}")]
    Enhancement(String),
}

impl From<gemini::GeminiError> for Error {
    fn from(err: gemini::GeminiError) -> Self {
        Error::Enhancement(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Enhancement(format!("malformed JSON: {}", err))
    }
}
