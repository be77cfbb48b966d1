//! Error types for the rust-ccnd implementation.

use thiserror::Error;

/// All possible errors that can occur within the rust-ccnd implementation.
#[derive(Error, Debug)]
pub enum Error {
    /// Error in the ccnb coding layer.
    #[error("ccnb coding error: {0}")]
    Coding(String),

    /// Error while parsing an Interest message.
    #[error("Interest parse error: {0}")]
    InterestParse(String),

    /// Error while parsing a ContentObject message.
    #[error("ContentObject parse error: {0}")]
    ContentParse(String),

    /// Error related to a face or its transport.
    #[error("face error: {0}")]
    Face(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable startup failure.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Other errors
    #[error("other error: {0}")]
    Other(String),
}
