use thiserror::Error;

/// Errors shared by the core resource abstractions (name validation, key
/// construction). Storage and allocation errors live in their own crates.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
