//! Catch-all error for this crate.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors that terminate a run.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration file could not be parsed or failed validation.
    #[error("configuration: {0}")]
    Config(String),
    /// The geometry block could not be parsed.
    #[error("geometry: {0}")]
    Geometry(String),
    /// A derivative index tuple matched none of the known partition
    /// patterns. This is a bug, never a user error.
    #[error("no stencil matches the index tuple {0:?}")]
    Stencil(Vec<i32>),
    /// A checkpoint file was missing or inconsistent with the current run.
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    /// An external program wrote the panic sentinel into its output.
    #[error("{}: output contains the panic sentinel", path.display())]
    ProgramPanic {
        /// The offending output file.
        path: PathBuf,
    },
    /// The signal listener could not be installed.
    #[error("signal setup failed with errno {0}")]
    SignalSetup(i32),
    /// Error while reading or writing a generated file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Error while serializing or deserializing a checkpoint.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type with the crate error.
pub type Result<T> = std::result::Result<T, Error>;
