// src/error.rs

use thiserror::Error;

/// Core error types for the restore engine
#[derive(Error, Debug)]
pub enum Error {
    /// The archive source could not be located or mounted
    #[error("Cannot read source '{0}'")]
    SourceUnavailable(String),

    /// Not a recognized backup archive, missing manifest entries, bad target
    #[error("Validation error: {0}")]
    Validation(String),

    /// Wrong or corrupt volume in a multi-volume sequence
    #[error("Volume mismatch: expected volume {expected} in {path}")]
    VolumeMismatch { expected: usize, path: String },

    /// A required extraction tool is absent and was not installed
    #[error("Extraction tool '{0}' is not installed")]
    ExtractionToolMissing(String),

    /// An external command could not be started
    #[error("Failed to execute '{program}': {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session profile or converter output could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the restore engine's Error type
pub type Result<T> = std::result::Result<T, Error>;
