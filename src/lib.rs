//! sip-ai-bridge - a SIP user agent that registers AI agents with a PBX and
//! bridges their calls to a WebSocket audio backend.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use domain::shared::error::DomainError;
pub use domain::shared::error::Result;
