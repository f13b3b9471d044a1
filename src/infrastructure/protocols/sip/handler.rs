//! SIP message handlers

use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use async_trait::async_trait;
use std::net::SocketAddr;

/// Trait for handling SIP requests
#[async_trait]
pub trait SipHandler: Send + Sync {
    /// Handle a SIP request.
    ///
    /// Returns the responses to send back to `source`, in order. An empty
    /// list means the request is absorbed silently (ACK).
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Vec<SipResponse>, SipError>;

    /// Check if this handler can handle the given method
    fn can_handle(&self, method: SipMethod) -> bool;
}
