//! Error types for comscope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open process {pid}: {message}")]
    ProcessOpen { pid: u32, message: String },

    #[error("target is {target}-bit but this host build can only inspect {host}-bit processes")]
    ArchitectureMismatch { target: u32, host: u32 },

    #[error("symbol engine error: {0}")]
    SymbolEngine(String),

    #[error("random generator failure: {0}")]
    Random(#[from] getrandom::Error),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
