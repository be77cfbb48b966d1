//! Common types and wire-format support for the rust-ccnd CCN daemon.
//!
//! This crate provides the ccnb binary encoding, Interest and ContentObject
//! parsing, name handling, and the metrics instruments shared by the
//! forwarder core and the client tools.

pub mod coding;
pub mod content;
pub mod error;
pub mod interest;
pub mod metrics;
pub mod name;

/// Reexport of common types
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum size of a ccnb message accepted on any face.
pub const MAX_MESSAGE_SIZE: usize = 8800;
