//! Server error types.

use std::io;

use thiserror::Error;

/// Errors from running a zipper.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener failed.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The configuration cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Forwarding to a mesh downstream failed.
    #[error("downstream {name}: {reason}")]
    Downstream {
        /// Downstream name
        name: String,
        /// What went wrong
        reason: String,
    },
}
