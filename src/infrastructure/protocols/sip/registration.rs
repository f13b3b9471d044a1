//! Outbound REGISTER with digest challenge/response, and the per-agent
//! refresh worker.

use super::auth::{build_authorization, DigestChallenge};
use super::builder::random_hex;
use super::message::{SipError, SipMessage, SipMethod, SipResponse};
use crate::domain::agent::{Agent, NO_EXPIRY};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for each REGISTER response
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

pub const USER_AGENT: &str = concat!("sip-ai-bridge/", env!("CARGO_PKG_VERSION"));

/// Which datagrams on the registration socket count as the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMatchPolicy {
    /// First parseable response, whatever its CSeq
    #[default]
    Lenient,
    /// Only responses whose CSeq names the expected method
    Strict,
}

impl ResponseMatchPolicy {
    pub fn accepts(&self, response: &SipResponse, method: SipMethod) -> bool {
        match self {
            ResponseMatchPolicy::Lenient => true,
            ResponseMatchPolicy::Strict => response
                .header("cseq")
                .map(|cseq| {
                    cseq.split_whitespace()
                        .any(|token| token.eq_ignore_ascii_case(method.as_str()))
                })
                .unwrap_or(false),
        }
    }
}

/// Everything one worker needs to keep an agent registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTarget {
    pub user: String,
    pub password: String,
    pub server_addr: String,
    pub domain: String,
    pub contact_host: String,
    /// Port of the SIP listener, advertised in Contact
    pub listen_port: u16,
    pub expires: u32,
}

impl RegistrationTarget {
    pub fn for_agent(agent: &Agent, contact_host: &str, listen_port: u16) -> Self {
        Self {
            user: agent.user.clone(),
            password: agent.password.clone(),
            server_addr: agent.server_addr.clone(),
            domain: agent.domain.clone(),
            contact_host: contact_host.to_string(),
            listen_port,
            expires: agent.expires,
        }
    }
}

/// Result of one successful REGISTER exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered,
    RegisteredWithAuth,
}

/// Delay before the next refresh: half the expiry but at least 10 s, and a
/// flat 60 s when registering without expiry.
pub fn refresh_interval(expires: u32) -> Duration {
    if expires >= NO_EXPIRY {
        Duration::from_secs(60)
    } else {
        Duration::from_secs((expires / 2).max(10) as u64)
    }
}

/// REGISTER dialog state for one agent. Call-ID and From tag stay fixed for
/// the client's lifetime.
///
/// CSeq is never reset: the first cycle sends 1 then 2 (challenge, then
/// authenticated), and later refreshes continue at 3, 4, ... RFC 3261
/// §10.2 requires it to grow within one Call-ID, so a refresh never reuses
/// a number the registrar has already seen.
pub struct RegistrationClient {
    target: RegistrationTarget,
    policy: ResponseMatchPolicy,
    call_id: String,
    from_tag: String,
    cseq: u32,
}

impl RegistrationClient {
    pub fn new(target: RegistrationTarget, policy: ResponseMatchPolicy) -> Self {
        Self {
            call_id: format!("{}@{}", random_hex(16), target.contact_host),
            from_tag: random_hex(10),
            cseq: 0,
            target,
            policy,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Request URI of every REGISTER
    pub fn request_uri(&self) -> String {
        format!("sip:{}", self.target.domain)
    }

    /// One challenge/response round.
    pub async fn register_once(&mut self, socket: &UdpSocket) -> Result<RegistrationOutcome, SipError> {
        let server = resolve_server(&self.target.server_addr).await?;
        let local_port = socket.local_addr()?.port();

        let request = self.build_request(local_port, None);
        socket.send_to(request.as_bytes(), server).await?;
        let response = wait_response(socket, RESPONSE_TIMEOUT, self.policy, SipMethod::Register).await?;

        match response.status_code() {
            200 => return Ok(RegistrationOutcome::Registered),
            401 | 407 => {}
            code => {
                return Err(SipError::InvalidMessage(format!(
                    "unexpected REGISTER response {} {}",
                    code,
                    response.reason()
                )))
            }
        }

        let header = response
            .header("www-authenticate")
            .or_else(|| response.header("proxy-authenticate"))
            .ok_or_else(|| {
                SipError::Authentication(format!(
                    "{} without a challenge header",
                    response.status_code()
                ))
            })?;
        let challenge = DigestChallenge::parse(header)?;
        debug!(
            "register[{}] challenged (realm={}, qop={})",
            self.target.user, challenge.realm, challenge.qop
        );

        let authorization = build_authorization(
            SipMethod::Register.as_str(),
            &self.request_uri(),
            &self.target.user,
            &self.target.password,
            &challenge,
            1,
        );
        let request = self.build_request(local_port, Some(&authorization));
        socket.send_to(request.as_bytes(), server).await?;
        let response = wait_response(socket, RESPONSE_TIMEOUT, self.policy, SipMethod::Register).await?;

        match response.status_code() {
            200 => Ok(RegistrationOutcome::RegisteredWithAuth),
            code => Err(SipError::Authentication(format!(
                "authenticated REGISTER rejected: {} {}",
                code,
                response.reason()
            ))),
        }
    }

    /// Next REGISTER, bumping CSeq and minting a fresh branch.
    fn build_request(&mut self, local_port: u16, authorization: Option<&str>) -> String {
        self.cseq += 1;
        let t = &self.target;

        let mut msg = String::with_capacity(512);
        msg.push_str(&format!("REGISTER {} SIP/2.0\r\n", self.request_uri()));
        msg.push_str(&format!(
            "Via: SIP/2.0/UDP {}:{};branch=z9hG4bK{};rport\r\n",
            t.contact_host,
            local_port,
            random_hex(12)
        ));
        msg.push_str("Max-Forwards: 70\r\n");
        msg.push_str(&format!(
            "From: <sip:{}@{}>;tag={}\r\n",
            t.user, t.domain, self.from_tag
        ));
        msg.push_str(&format!("To: <sip:{}@{}>\r\n", t.user, t.domain));
        msg.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        msg.push_str(&format!("CSeq: {} REGISTER\r\n", self.cseq));
        msg.push_str(&format!(
            "Contact: <sip:{}@{}:{};transport=udp>\r\n",
            t.user, t.contact_host, t.listen_port
        ));
        msg.push_str(&format!("Expires: {}\r\n", t.expires));
        msg.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
        if let Some(authorization) = authorization {
            msg.push_str(&format!("Authorization: {}\r\n", authorization));
        }
        msg.push_str("Content-Length: 0\r\n\r\n");
        msg
    }
}

async fn resolve_server(addr: &str) -> Result<SocketAddr, SipError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| SipError::TransportError(format!("cannot resolve {}: {}", addr, e)))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| SipError::TransportError(format!("no IPv4 address for {}", addr)))
}

/// Read until a response the policy accepts arrives or `timeout` runs out.
/// Requests and unparseable datagrams are skipped.
pub async fn wait_response(
    socket: &UdpSocket,
    timeout: Duration,
    policy: ResponseMatchPolicy,
    method: SipMethod,
) -> Result<SipResponse, SipError> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; 65535];

    loop {
        let (n, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                return Err(SipError::TransportError(format!(
                    "timeout waiting for {} response",
                    method
                )))
            }
        };

        match SipMessage::parse(&buf[..n]) {
            Ok(SipMessage::Response(response)) if policy.accepts(&response, method) => {
                return Ok(response)
            }
            Ok(SipMessage::Response(response)) => {
                debug!(
                    "Skipping response {} from {} (CSeq {:?})",
                    response.status_code(),
                    from,
                    response.header("cseq")
                );
            }
            Ok(SipMessage::Request(request)) => {
                debug!("Skipping {} request on registration socket", request.method_str());
            }
            Err(e) => debug!("Skipping unparseable datagram from {}: {}", from, e),
        }
    }
}

/// Background task keeping one agent registered until cancelled
pub struct RegistrationWorker {
    user: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RegistrationWorker {
    pub fn spawn(target: RegistrationTarget, policy: ResponseMatchPolicy) -> Self {
        let cancel = CancellationToken::new();
        let user = target.user.clone();
        let handle = tokio::spawn(Self::run(target, policy, cancel.clone()));
        Self { user, cancel, handle }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Cancel and wait for the task to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("register[{}] worker ended abnormally: {}", self.user, e);
        }
    }

    async fn run(target: RegistrationTarget, policy: ResponseMatchPolicy, cancel: CancellationToken) {
        let user = target.user.clone();
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("register[{}] cannot bind socket: {}", user, e);
                return;
            }
        };

        let interval = refresh_interval(target.expires);
        let expires = target.expires;
        let server = target.server_addr.clone();
        let mut client = RegistrationClient::new(target, policy);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = client.register_once(&socket) => result,
            };

            match result {
                Ok(RegistrationOutcome::Registered) => {
                    info!("register[{}] registered with {} (expires={}s, no auth)", user, server, expires)
                }
                Ok(RegistrationOutcome::RegisteredWithAuth) => {
                    info!("register[{}] registered with {} (expires={}s)", user, server, expires)
                }
                Err(e) => warn!("register[{}] failed: {}", user, e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!("register[{}] worker stopped", user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipRequest;

    fn target(server: SocketAddr) -> RegistrationTarget {
        RegistrationTarget {
            user: "1001".to_string(),
            password: "secret".to_string(),
            server_addr: server.to_string(),
            domain: "pbx.local".to_string(),
            contact_host: "10.9.8.7".to_string(),
            listen_port: 5090,
            expires: 300,
        }
    }

    async fn recv_request(socket: &UdpSocket) -> (SipRequest, SocketAddr) {
        let mut buf = vec![0u8; 4096];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (SipRequest::parse(&buf[..n]).unwrap(), from)
    }

    #[test]
    fn test_refresh_interval() {
        assert_eq!(refresh_interval(300), Duration::from_secs(150));
        assert_eq!(refresh_interval(10), Duration::from_secs(10));
        assert_eq!(refresh_interval(1), Duration::from_secs(10));
        assert_eq!(refresh_interval(NO_EXPIRY), Duration::from_secs(60));
    }

    #[test]
    fn test_strict_policy_checks_cseq_method() {
        let ok = SipResponse::parse(b"SIP/2.0 200 OK\r\nCSeq: 2 REGISTER\r\n\r\n").unwrap();
        let other = SipResponse::parse(b"SIP/2.0 200 OK\r\nCSeq: 2 OPTIONS\r\n\r\n").unwrap();
        let none = SipResponse::parse(b"SIP/2.0 200 OK\r\n\r\n").unwrap();

        assert!(ResponseMatchPolicy::Strict.accepts(&ok, SipMethod::Register));
        assert!(!ResponseMatchPolicy::Strict.accepts(&other, SipMethod::Register));
        assert!(!ResponseMatchPolicy::Strict.accepts(&none, SipMethod::Register));
        assert!(ResponseMatchPolicy::Lenient.accepts(&other, SipMethod::Register));
    }

    #[test]
    fn test_request_format() {
        let mut client = RegistrationClient::new(
            target("127.0.0.1:5060".parse().unwrap()),
            ResponseMatchPolicy::Lenient,
        );
        let first = client.build_request(40000, None);
        let second = client.build_request(40000, Some("Digest x"));

        let req = SipRequest::parse(first.as_bytes()).unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.uri(), "sip:pbx.local");
        let via = req.header("via").unwrap();
        assert!(via.starts_with("SIP/2.0/UDP 10.9.8.7:40000;branch=z9hG4bK"));
        assert!(via.ends_with(";rport"));
        assert_eq!(req.header("max-forwards"), Some("70"));
        assert_eq!(req.header("to"), Some("<sip:1001@pbx.local>"));
        assert_eq!(req.header("cseq"), Some("1 REGISTER"));
        assert_eq!(
            req.header("contact"),
            Some("<sip:1001@10.9.8.7:5090;transport=udp>")
        );
        assert_eq!(req.header("expires"), Some("300"));
        assert_eq!(req.header("user-agent"), Some(USER_AGENT));
        assert_eq!(req.header("authorization"), None);
        assert!(req.call_id().unwrap().ends_with("@10.9.8.7"));

        let req2 = SipRequest::parse(second.as_bytes()).unwrap();
        assert_eq!(req2.header("cseq"), Some("2 REGISTER"));
        assert_eq!(req2.call_id(), req.call_id());
        assert_eq!(req2.header("from"), req.header("from"));
        assert_ne!(req2.header("via"), req.header("via"));
        assert_eq!(req2.header("authorization"), Some("Digest x"));
    }

    #[tokio::test]
    async fn test_register_without_challenge() {
        let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = RegistrationClient::new(
            target(registrar.local_addr().unwrap()),
            ResponseMatchPolicy::Lenient,
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Two refresh cycles on the same client: CSeq keeps counting
        for expected_cseq in ["1 REGISTER", "2 REGISTER"] {
            let server = async {
                let (req, from) = recv_request(&registrar).await;
                assert_eq!(req.header("cseq"), Some(expected_cseq));
                let reply = format!(
                    "SIP/2.0 200 OK\r\nCall-ID: {}\r\nCSeq: {}\r\n\r\n",
                    req.call_id().unwrap(),
                    expected_cseq
                );
                registrar.send_to(reply.as_bytes(), from).await.unwrap();
            };
            let (outcome, _) = tokio::join!(client.register_once(&socket), server);
            assert_eq!(outcome.unwrap(), RegistrationOutcome::Registered);
        }
    }

    #[tokio::test]
    async fn test_register_rejected_status() {
        let registrar = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = RegistrationClient::new(
            target(registrar.local_addr().unwrap()),
            ResponseMatchPolicy::Lenient,
        );
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let server = async {
            let (_, from) = recv_request(&registrar).await;
            registrar
                .send_to(b"SIP/2.0 403 Forbidden\r\nCSeq: 1 REGISTER\r\n\r\n", from)
                .await
                .unwrap();
        };
        let (outcome, _) = tokio::join!(client.register_once(&socket), server);
        assert!(matches!(outcome, Err(SipError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_wait_response_skips_requests_and_garbage() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        peer.send_to(b"OPTIONS sip:x SIP/2.0\r\n\r\n", addr).await.unwrap();
        peer.send_to(b"\x00\x01", addr).await.unwrap();
        peer.send_to(b"SIP/2.0 200 OK\r\nCSeq: 9 OPTIONS\r\n\r\n", addr).await.unwrap();
        peer.send_to(b"SIP/2.0 401 Unauthorized\r\nCSeq: 1 REGISTER\r\n\r\n", addr).await.unwrap();

        let strict = wait_response(
            &socket,
            Duration::from_secs(2),
            ResponseMatchPolicy::Strict,
            SipMethod::Register,
        )
        .await
        .unwrap();
        assert_eq!(strict.status_code(), 401);
    }

    #[tokio::test]
    async fn test_wait_response_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let result = wait_response(
            &socket,
            Duration::from_millis(50),
            ResponseMatchPolicy::Lenient,
            SipMethod::Register,
        )
        .await;
        assert!(matches!(result, Err(SipError::TransportError(_))));
    }
}
