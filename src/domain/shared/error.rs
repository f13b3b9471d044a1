//! Domain errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// An agent record that cannot be registered
    #[error("invalid agent: {0}")]
    InvalidAgent(String),

    /// A second session for a Call-ID that is still active
    #[error("call already active: {0}")]
    CallExists(String),
}
