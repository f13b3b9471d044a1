//! Per-call RTP media: echo, drain and the WebSocket bridge

pub mod bridge;
pub mod codec;
pub mod playback;
pub mod rtp;
pub mod stream;

pub use bridge::{run_bridged, FlushPolicy};
pub use codec::{G711Type, PcmaCodec, PcmuCodec};
pub use playback::{PlaybackCommand, PlaybackWorker};
pub use rtp::{RtpError, RtpPacket};
pub use stream::{run_drain, run_echo, MediaStats};

use crate::domain::Agent;
use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// What a call does with the caller's audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaMode {
    Echo,
    Drain,
    Bridged { url: String },
}

impl MediaMode {
    /// Agents with a streaming URL are bridged, the rest are echoed.
    pub fn for_agent(agent: &Agent) -> Self {
        match &agent.stream_url {
            Some(url) if !url.trim().is_empty() => MediaMode::Bridged {
                url: url.trim().to_string(),
            },
            _ => MediaMode::Echo,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MediaMode::Echo => "echo",
            MediaMode::Drain => "drain",
            MediaMode::Bridged { .. } => "bridged",
        }
    }
}

/// Everything a media loop needs from its call
#[derive(Debug, Clone)]
pub struct MediaContext {
    pub call_id: String,
    pub extension: String,
    pub socket: Arc<UdpSocket>,
    /// Cancelled when the call is torn down
    pub cancel: CancellationToken,
}

/// Run the call's media until it is cancelled or its socket fails.
pub async fn run(ctx: &MediaContext, mode: &MediaMode, flush: FlushPolicy) -> io::Result<()> {
    match mode {
        MediaMode::Echo => run_echo(ctx).await,
        MediaMode::Drain => run_drain(ctx).await,
        MediaMode::Bridged { url } => run_bridged(ctx, url, flush).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentSource;

    #[test]
    fn test_mode_for_agent() {
        let mut agent = Agent {
            id: "a".to_string(),
            source: AgentSource::Pbx,
            user: "1001".to_string(),
            password: "pw".to_string(),
            server_addr: "10.0.0.1:5060".to_string(),
            domain: "10.0.0.1".to_string(),
            expires: 300,
            stream_url: None,
            enabled: true,
        };
        assert_eq!(MediaMode::for_agent(&agent), MediaMode::Echo);

        agent.stream_url = Some("ws://ai:8080/stream".to_string());
        assert_eq!(
            MediaMode::for_agent(&agent),
            MediaMode::Bridged {
                url: "ws://ai:8080/stream".to_string()
            }
        );
        assert_eq!(MediaMode::for_agent(&agent).name(), "bridged");
    }
}
