//! Call handling (INVITE, ACK, BYE, CANCEL, OPTIONS)

use super::builder::{ensure_to_tag, ResponseBuilder};
use super::handler::SipHandler;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};
use super::sdp::{build_sdp, remote_audio_endpoint};
use crate::application::{CallSession, RuntimeState};
use crate::infrastructure::media::{self, MediaContext, MediaMode};
use crate::infrastructure::net::FALLBACK_IPV4;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Methods this agent answers
pub const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

const SUPPORTED: &str = "replaces, timer";

/// INVITE handler: answers every call for a known extension
pub struct InviteHandler {
    runtime: Arc<RuntimeState>,
}

impl InviteHandler {
    pub fn new(runtime: Arc<RuntimeState>) -> Self {
        Self { runtime }
    }

    async fn handle_invite(&self, request: &SipRequest, source: SocketAddr) -> Vec<SipResponse> {
        let reject = |code: u16| vec![ResponseBuilder::new(code).build_for_request(request)];

        let Some(extension) = request.to_user() else {
            warn!("INVITE from {} with non-numeric To user: {:?}", source, request.header("to"));
            return reject(400);
        };
        let Some(agent) = self.runtime.agent(&extension).await else {
            info!("INVITE for unknown extension {} from {}", extension, source);
            return reject(404);
        };
        let Some(call_id) = request.call_id().map(str::to_string) else {
            warn!("INVITE for {} without Call-ID", extension);
            return reject(400);
        };
        if self.runtime.has_call(&call_id).await {
            info!("INVITE for active call {}, busy", call_id);
            return reject(486);
        }

        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("RTP socket allocation failed for {}: {}", call_id, e);
                return reject(500);
            }
        };
        let rtp_port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                error!("RTP socket has no local address for {}: {}", call_id, e);
                return reject(500);
            }
        };

        let mode = MediaMode::for_agent(&agent);
        let generation = self.runtime.next_generation();
        let session = CallSession::new(&call_id, &extension, generation, mode.clone(), rtp_port);
        let cancel = session.cancel.clone();
        if let Err(e) = self.runtime.try_insert_call(session).await {
            info!("Lost race for call {}: {}", call_id, e);
            return reject(486);
        }

        if let Some((host, port)) = remote_audio_endpoint(&String::from_utf8_lossy(request.body())) {
            debug!("Caller media for {} offered at {}:{}", call_id, host, port);
        }

        let identity = self.runtime.network_identity().await;
        let sdp_ip = identity.sdp_ip.parse::<IpAddr>().unwrap_or_else(|_| {
            warn!("SDP address {:?} is not an IP, using {}", identity.sdp_ip, FALLBACK_IPV4);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        let to = ensure_to_tag(request.header("to").unwrap_or_default());

        let responses = vec![
            ResponseBuilder::new(100).to(to.clone()).build_for_request(request),
            ResponseBuilder::new(180).to(to.clone()).build_for_request(request),
            ResponseBuilder::ok()
                .to(to)
                .contact(identity.contact_uri(&extension))
                .header("Content-Type", "application/sdp")
                .header("Allow", ALLOW)
                .header("Supported", SUPPORTED)
                .body(build_sdp(sdp_ip, rtp_port).into_bytes())
                .build_for_request(request),
        ];
        self.runtime.mark_answered(&call_id).await;
        info!(
            "Answering call {} for ext {} from {} ({} media, rtp port {})",
            call_id,
            extension,
            source,
            mode.name(),
            rtp_port
        );

        let ctx = MediaContext {
            call_id,
            extension,
            socket: Arc::new(socket),
            cancel,
        };
        let runtime = self.runtime.clone();
        let flush = runtime.options().flush;
        tokio::spawn(async move {
            if let Err(e) = media::run(&ctx, &mode, flush).await {
                warn!("Media for call {} failed: {}", ctx.call_id, e);
            }
            if runtime.remove_call_if(&ctx.call_id, generation).await {
                info!("Call {} ended (ext {})", ctx.call_id, ctx.extension);
            }
        });

        responses
    }
}

#[async_trait]
impl SipHandler for InviteHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Vec<SipResponse>, SipError> {
        Ok(self.handle_invite(&request, source).await)
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Invite)
    }
}

/// ACK completes the INVITE transaction; nothing to answer
pub struct AckHandler;

#[async_trait]
impl SipHandler for AckHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
    ) -> Result<Vec<SipResponse>, SipError> {
        debug!("ACK for call {:?}", request.call_id());
        Ok(Vec::new())
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Ack)
    }
}

/// BYE and CANCEL both answer 200 and tear the call down
pub struct HangupHandler {
    runtime: Arc<RuntimeState>,
    method: SipMethod,
}

impl HangupHandler {
    pub fn bye(runtime: Arc<RuntimeState>) -> Self {
        Self {
            runtime,
            method: SipMethod::Bye,
        }
    }

    pub fn cancel(runtime: Arc<RuntimeState>) -> Self {
        Self {
            runtime,
            method: SipMethod::Cancel,
        }
    }
}

#[async_trait]
impl SipHandler for HangupHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<Vec<SipResponse>, SipError> {
        let response = ResponseBuilder::ok().build_for_request(&request);

        match request.call_id() {
            Some(call_id) => match self.runtime.remove_call(call_id).await {
                Some(session) => info!(
                    "Call {} ended by {} from {} (ext {})",
                    call_id, self.method, source, session.extension
                ),
                None => debug!("{} for unknown call {}", self.method, call_id),
            },
            None => debug!("{} without Call-ID from {}", self.method, source),
        }

        Ok(vec![response])
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        method == self.method
    }
}

pub struct OptionsHandler;

#[async_trait]
impl SipHandler for OptionsHandler {
    async fn handle_request(
        &self,
        request: SipRequest,
        _source: SocketAddr,
    ) -> Result<Vec<SipResponse>, SipError> {
        Ok(vec![ResponseBuilder::ok()
            .header("Allow", ALLOW)
            .build_for_request(&request)])
    }

    fn can_handle(&self, method: SipMethod) -> bool {
        matches!(method, SipMethod::Options)
    }
}
