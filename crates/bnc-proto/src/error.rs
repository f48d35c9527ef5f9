//! Protocol-level error types.

use thiserror::Error;

/// Errors that can occur while parsing or serializing an IRC line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line did not parse as a well-formed IRC message.
    #[error("malformed IRC line: {0}")]
    Malformed(String),

    /// The line (or a component of it) exceeded a protocol size limit.
    #[error("line too long")]
    TooLong,
}
