//! Registry error types

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No relay with this name
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    /// A relay with this name is already registered
    #[error("stream already registered: {0}")]
    StreamAlreadyExists(String),
}
