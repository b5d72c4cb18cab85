//! Error types for the resource model.

use thiserror::Error;

/// Errors that can occur when parsing object keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key string is empty.
    #[error("key cannot be empty")]
    Empty,

    /// The key has more than one `/` separator.
    #[error("unexpected key format: '{0}'")]
    Malformed(String),

    /// The name portion of the key is empty.
    #[error("key '{0}' has an empty name")]
    EmptyName(String),
}
