//! Agents: SIP identities that answer calls on behalf of an AI backend

use super::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `Expires` value that stands for "never expires"
pub const NO_EXPIRY: u32 = 31_536_000;

/// Where an agent's SIP identity lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    /// Extension on the local PBX; credentials come from the defaults
    Pbx,
    /// Account on another SIP server with its own credentials
    External,
}

impl AgentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSource::Pbx => "pbx",
            AgentSource::External => "external",
        }
    }
}

impl fmt::Display for AgentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved agent, keyed by `user`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub source: AgentSource,
    pub user: String,
    pub password: String,
    /// Upstream SIP server as `host:port`
    pub server_addr: String,
    pub domain: String,
    /// Register refresh interval in seconds
    pub expires: u32,
    /// Streaming endpoint of the AI backend; calls are echoed without it
    pub stream_url: Option<String>,
    pub enabled: bool,
}

impl Agent {
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(DomainError::InvalidAgent(format!(
                "agent {}: empty SIP user",
                self.id
            )));
        }
        if self.source == AgentSource::Pbx && !self.user.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::InvalidAgent(format!(
                "agent {}: pbx extension must be digits, got {:?}",
                self.id, self.user
            )));
        }
        if self.password.is_empty() {
            return Err(DomainError::InvalidAgent(format!(
                "agent {}: empty password",
                self.id
            )));
        }
        if self.server_addr.is_empty() || self.domain.is_empty() {
            return Err(DomainError::InvalidAgent(format!(
                "agent {}: missing server address or domain",
                self.id
            )));
        }
        Ok(())
    }
}

/// Streaming endpoints are plain or TLS WebSocket URLs.
pub fn is_stream_url(url: &str) -> bool {
    let url = url.trim();
    ["ws://", "wss://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

/// Convert a configured `registerExpires` value: zero means no expiry.
pub fn normalize_expires(expires: u32) -> u32 {
    if expires == 0 {
        NO_EXPIRY
    } else {
        expires
    }
}
