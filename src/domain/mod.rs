//! Domain layer - agents and audio processing rules

pub mod agent;
pub mod audio;
pub mod shared;

pub use agent::{Agent, AgentSource};
pub use shared::{DomainError, Result};
