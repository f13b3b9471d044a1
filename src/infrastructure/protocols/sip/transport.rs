//! SIP over UDP
//!
//! One socket carries every inbound request and every response we send.
//! Outbound REGISTER traffic uses its own sockets (see `registration`).

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM: usize = 65535;

/// Depth of the queue between the socket reader and the dispatcher
const INBOUND_QUEUE: usize = 1024;

/// A parsed message and the address it came from
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Encoded bytes addressed to a peer
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub destination: SocketAddr,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Bind and start reading. Returns the bound address.
    async fn start(&mut self) -> Result<SocketAddr, SipError>;

    async fn stop(&mut self) -> Result<(), SipError>;

    async fn send(&self, datagram: Datagram) -> Result<(), SipError>;

    /// Hand out the inbound queue. Only the first caller gets it.
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<Inbound>>;
}

pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Inbound>,
    rx: Option<mpsc::Receiver<Inbound>>,
}

/// CRLF pings (RFC 5626) and stray padding carry no message.
fn is_keepalive(data: &[u8]) -> bool {
    data.iter().all(|b| matches!(b, b'\r' | b'\n' | b' ' | b'\t' | 0))
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            bind_addr,
            socket: None,
            cancel: CancellationToken::new(),
            tx,
            rx: Some(rx),
        }
    }

    async fn read_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (size, source) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP unreachable from an earlier send lands here; the socket is still usable
                        warn!("SIP socket receive error: {}", e);
                        continue;
                    }
                },
            };

            let data = &buf[..size];
            if is_keepalive(data) {
                trace!("Keepalive from {}", source);
                continue;
            }

            let message = match SipMessage::parse(data) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping unparseable datagram from {} ({} bytes): {}", source, size, e);
                    continue;
                }
            };

            if tx.send(Inbound { message, source }).await.is_err() {
                debug!("SIP dispatcher gone, stopping reader");
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<SocketAddr, SipError> {
        let socket = UdpSocket::bind(self.bind_addr).await.map_err(|e| {
            SipError::TransportError(format!("cannot bind {}: {}", self.bind_addr, e))
        })?;
        let local_addr = socket.local_addr()?;
        info!("SIP UDP socket bound on {}", local_addr);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());
        tokio::spawn(Self::read_loop(socket, self.tx.clone(), self.cancel.clone()));

        Ok(local_addr)
    }

    async fn stop(&mut self) -> Result<(), SipError> {
        self.cancel.cancel();
        self.socket = None;
        debug!("SIP UDP socket closed");
        Ok(())
    }

    async fn send(&self, datagram: Datagram) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("transport not started".to_string()))?;

        trace!("Sending {} bytes to {}", datagram.data.len(), datagram.destination);
        socket
            .send_to(&datagram.data, datagram.destination)
            .await
            .map_err(|e| {
                SipError::TransportError(format!("send to {} failed: {}", datagram.destination, e))
            })?;
        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<Inbound>> {
        self.rx.take()
    }
}
