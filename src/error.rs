// src/error.rs

use thiserror::Error;

/// Core error types for gencontrol
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed relation, restriction or control text
    #[error("Parse error: {0}")]
    Parse(String),

    /// Version string rejected by the version grammar
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Required configuration key, template or variable is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Version/distribution combination violates release rules
    #[error("Policy violation: {0}")]
    Policy(String),

    /// External command failed or produced malformed output
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Key or field not allowed by a fixed schema
    #[error("Schema error: {0}")]
    Schema(String),
}

/// Result type alias using gencontrol's Error type
pub type Result<T> = std::result::Result<T, Error>;
