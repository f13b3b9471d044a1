//! SIP server: UDP listener dispatching requests to per-method handlers

use super::builder::ResponseBuilder;
use super::handler::SipHandler;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{Datagram, Inbound, Transport, UdpTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

type HandlerMap = Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>;

/// SIP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipServerConfig {
    pub udp_bind: SocketAddr,
}

impl SipServerConfig {
    pub fn new(udp_bind: SocketAddr) -> Self {
        Self { udp_bind }
    }
}

/// SIP server
pub struct SipServer {
    config: SipServerConfig,
    transport: Arc<RwLock<UdpTransport>>,
    handlers: HandlerMap,
    local_addr: Option<SocketAddr>,
}

impl SipServer {
    pub fn new(config: SipServerConfig) -> Self {
        Self {
            transport: Arc::new(RwLock::new(UdpTransport::new(config.udp_bind))),
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            local_addr: None,
        }
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        if !handler.can_handle(method) {
            warn!("Handler registered for {} does not claim that method", method);
        }
        let mut handlers = self.handlers.write().await;
        handlers.insert(method, handler);
        info!("Registered handler for SIP method: {}", method);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start dispatching. One task per datagram.
    pub async fn start(&mut self) -> Result<SocketAddr, SipError> {
        info!("Starting SIP server on {}", self.config.udp_bind);

        let (local_addr, mut rx) = {
            let mut transport = self.transport.write().await;
            let local_addr = transport.start().await?;
            let rx = transport
                .take_receiver()
                .ok_or_else(|| SipError::Internal("SIP server already started".to_string()))?;
            (local_addr, rx)
        };
        self.local_addr = Some(local_addr);

        let handlers = self.handlers.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let handlers = handlers.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    if let Err(e) = Self::process_message(inbound, handlers, transport).await {
                        error!("Error processing SIP message: {}", e);
                    }
                });
            }
            debug!("SIP dispatch loop ended");
        });

        info!("SIP server listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn process_message(
        inbound: Inbound,
        handlers: HandlerMap,
        transport: Arc<RwLock<UdpTransport>>,
    ) -> Result<(), SipError> {
        let request = match inbound.message {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => {
                debug!(
                    "Ignoring SIP response {} from {}",
                    response.status_code(),
                    inbound.source
                );
                return Ok(());
            }
        };

        debug!(
            "Processing {} from {} (Call-ID {:?})",
            request.method_str(),
            inbound.source,
            request.call_id()
        );

        let handler = match request.method() {
            Some(method) => handlers.read().await.get(&method).cloned(),
            None => None,
        };

        let responses = match handler {
            Some(handler) => match handler.handle_request(request.clone(), inbound.source).await {
                Ok(responses) => responses,
                Err(e) => {
                    error!("Handler error for {}: {}", request.method_str(), e);
                    vec![ResponseBuilder::new(500).build_for_request(&request)]
                }
            },
            None => {
                warn!("No handler for method: {}", request.method_str());
                vec![ResponseBuilder::not_implemented().build_for_request(&request)]
            }
        };

        Self::send_all(&transport, &request, responses, inbound.source).await
    }

    async fn send_all(
        transport: &Arc<RwLock<UdpTransport>>,
        request: &SipRequest,
        responses: Vec<SipResponse>,
        destination: SocketAddr,
    ) -> Result<(), SipError> {
        let transport = transport.read().await;
        for response in responses {
            debug!(
                "Sending {} {} for {} to {}",
                response.status_code(),
                response.reason(),
                request.method_str(),
                destination
            );
            transport
                .send(Datagram {
                    data: response.to_bytes(),
                    destination,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping SIP server");
        self.transport.write().await.stop().await?;
        info!("SIP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    struct FailingHandler;

    #[async_trait]
    impl SipHandler for FailingHandler {
        async fn handle_request(
            &self,
            _request: SipRequest,
            _source: SocketAddr,
        ) -> Result<Vec<SipResponse>, SipError> {
            Err(SipError::Internal("boom".to_string()))
        }

        fn can_handle(&self, method: SipMethod) -> bool {
            method == SipMethod::Options
        }
    }

    async fn recv_response(socket: &UdpSocket) -> SipResponse {
        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        SipResponse::parse(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn test_unhandled_methods_get_501() {
        let mut server = SipServer::new(SipServerConfig::new("127.0.0.1:0".parse().unwrap()));
        let addr = server.start().await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(b"SUBSCRIBE sip:1001@x SIP/2.0\r\nCall-ID: s1\r\nCSeq: 1 SUBSCRIBE\r\n\r\n", addr)
            .await
            .unwrap();
        let response = recv_response(&client).await;
        assert_eq!(response.status_code(), 501);
        assert_eq!(response.header("call-id"), Some("s1"));

        client
            .send_to(b"BYE sip:1001@x SIP/2.0\r\nCall-ID: s2\r\nCSeq: 2 BYE\r\n\r\n", addr)
            .await
            .unwrap();
        assert_eq!(recv_response(&client).await.status_code(), 501);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_500() {
        let mut server = SipServer::new(SipServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server
            .register_handler(SipMethod::Options, Arc::new(FailingHandler))
            .await;
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"OPTIONS sip:1001@x SIP/2.0\r\nCall-ID: o1\r\nCSeq: 1 OPTIONS\r\n\r\n", addr)
            .await
            .unwrap();
        assert_eq!(recv_response(&client).await.status_code(), 500);
    }
}
