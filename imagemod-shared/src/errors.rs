//! Error types for image modification.
//!
//! Variants follow how a caller is expected to react:
//! - `Config`: the edit was described wrongly, fix the options
//! - `InvalidState`: the image does not have the shape the edit needs
//! - `NotFound` / `Conflict`: the edit would silently do nothing or pick a side
//! - `Network` / `Storage`: collaborator or local I/O failed
//!
//! Every variant aborts the whole modify operation.

use thiserror::Error;

/// Result alias used across imagemod crates.
pub type ImageModResult<T> = Result<T, ImageModError>;

#[derive(Debug, Error)]
pub enum ImageModError {
    /// Invalid option or configuration, detected before any I/O.
    #[error("config: {0}")]
    Config(String),

    /// The image or DAG is not in the shape an edit requires.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A lookup the edit depends on found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two sources resolved to different values.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Registry collaborator failure (manifest or blob fetch, timeout).
    #[error("network: {0}")]
    Network(String),

    /// Local storage failure (temp files, archive read/write, compression).
    #[error("storage: {0}")]
    Storage(String),

    /// Content or manifest kind this engine does not handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The execution context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

impl ImageModError {
    /// Whether the error was detected while validating options, before any I/O.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
