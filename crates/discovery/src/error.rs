//! Error types for peer discovery.

use thiserror::Error;

/// Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Binding or configuring the UDP socket failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
