//! Echo and drain receive loops

use super::rtp::RtpPacket;
use super::MediaContext;
use std::io;
use std::net::SocketAddr;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// Read deadline for a single RTP datagram
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Period of the per-call counters log
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

const MAX_RTP_DATAGRAM: usize = 2048;

/// Per-second RTP counters
#[derive(Debug, Default, Clone)]
pub struct MediaStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub last_payload_type: Option<u8>,
    pub peer: Option<SocketAddr>,
}

impl MediaStats {
    pub fn is_idle(&self) -> bool {
        self.rx_packets == 0 && self.tx_packets == 0
    }

    /// Log the counters when anything moved, then reset them. The peer and
    /// payload type are kept.
    fn report(&mut self, mode: &str, ctx: &MediaContext) {
        if self.is_idle() {
            return;
        }
        info!(
            "rtp {} ext={} call-id={} addr={:?} pt={:?} rx={} tx={}",
            mode,
            ctx.extension,
            ctx.call_id,
            self.peer,
            self.last_payload_type,
            self.rx_packets,
            self.tx_packets
        );
        self.rx_packets = 0;
        self.tx_packets = 0;
    }
}

/// Send every RTP packet back to its sender under a fresh SSRC.
pub async fn run_echo(ctx: &MediaContext) -> io::Result<()> {
    let ssrc: u32 = rand::random();
    info!(
        "rtp echo started ext={} call-id={} ssrc={:08x}",
        ctx.extension, ctx.call_id, ssrc
    );
    receive_loop(ctx, Some(ssrc)).await
}

/// Read and count RTP packets without ever transmitting.
pub async fn run_drain(ctx: &MediaContext) -> io::Result<()> {
    info!("rtp drain started ext={} call-id={}", ctx.extension, ctx.call_id);
    receive_loop(ctx, None).await
}

async fn receive_loop(ctx: &MediaContext, echo_ssrc: Option<u32>) -> io::Result<()> {
    let mode = if echo_ssrc.is_some() { "echo" } else { "drain" };
    let mut stats = MediaStats::default();
    let mut ticker = interval(STATS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut buf = vec![0u8; MAX_RTP_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!("rtp {} stopped call-id={}", mode, ctx.call_id);
                return Ok(());
            }
            _ = ticker.tick() => {
                stats.report(mode, ctx);
                continue;
            }
            received = timeout(READ_TIMEOUT, ctx.socket.recv_from(&mut buf)) => received,
        };

        let (size, peer) = match received {
            Err(_) => continue,
            Ok(result) => result?,
        };
        stats.rx_packets += 1;
        stats.peer = Some(peer);

        let packet = match RtpPacket::parse(&buf[..size]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping non-RTP datagram from {}: {}", peer, e);
                continue;
            }
        };
        stats.last_payload_type = Some(packet.payload_type);

        if let Some(ssrc) = echo_ssrc {
            let reply = packet.echo_reply(ssrc);
            ctx.socket.send_to(&reply.serialize(), peer).await?;
            stats.tx_packets += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::net::UdpSocket;
    use tokio_util::sync::CancellationToken;

    async fn context() -> MediaContext {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        MediaContext {
            call_id: "call-1".to_string(),
            extension: "1001".to_string(),
            socket: Arc::new(socket),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_echo_keeps_sequence_and_swaps_ssrc() {
        let ctx = context().await;
        let media_addr = ctx.socket.local_addr().unwrap();
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(async move { run_echo(&ctx).await });

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"not rtp", media_addr).await.unwrap();
        let mut sent = RtpPacket::new(0, 4242, 160_000, 0x0BADF00D, Bytes::from(vec![0xFFu8; 160]));
        sent.set_marker(true);
        peer.send_to(&sent.serialize(), media_addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, media_addr);

        let echoed = RtpPacket::parse(&buf[..n]).unwrap();
        assert_eq!(echoed.sequence, 4242);
        assert_eq!(echoed.timestamp, 160_000);
        assert!(echoed.marker);
        assert_eq!(echoed.payload, sent.payload);
        assert_ne!(echoed.ssrc, 0x0BADF00D);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_drain_never_transmits() {
        let ctx = context().await;
        let media_addr = ctx.socket.local_addr().unwrap();
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(async move { run_drain(&ctx).await });

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = RtpPacket::new(8, 1, 160, 7, Bytes::from_static(&[0xD5; 160]));
        peer.send_to(&packet.serialize(), media_addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let reply = tokio::time::timeout(Duration::from_millis(400), peer.recv_from(&mut buf)).await;
        assert!(reply.is_err());

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_stats_idle() {
        let mut stats = MediaStats::default();
        assert!(stats.is_idle());
        stats.rx_packets = 1;
        assert!(!stats.is_idle());
    }
}
