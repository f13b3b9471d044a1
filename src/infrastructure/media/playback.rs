//! Paced PCMU playback toward the caller
//!
//! In bridged mode this worker is the only writer of RTP on the call's
//! socket. It owns the SSRC, sequence and timestamp of the downlink stream
//! and emits one 20 ms frame per tick once the caller's address is known.

use super::codec::PcmuCodec;
use super::rtp::RtpPacket;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Samples per 20 ms frame at 8 kHz
pub const FRAME_SAMPLES: usize = 160;

pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Two seconds of 8 kHz audio
pub const MAX_BUFFERED_SAMPLES: usize = 16000;

/// Capacity of the command queue feeding the worker
pub const COMMAND_QUEUE_DEPTH: usize = 32;

const PCMU_PAYLOAD_TYPE: u8 = 0;
const MULAW_SILENCE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackCommand {
    /// 8 kHz PCM16 samples to append
    Audio(Vec<i16>),
    /// Drop everything buffered; the next packet carries the marker bit
    Flush,
}

/// Buffer and RTP numbering state of the downlink stream
#[derive(Debug)]
pub struct PlaybackState {
    buffer: Vec<i16>,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    marker_pending: bool,
}

impl PlaybackState {
    pub fn new(ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            buffer: Vec::new(),
            ssrc,
            sequence,
            timestamp,
            marker_pending: true,
        }
    }

    /// Random SSRC, sequence and timestamp
    pub fn random() -> Self {
        Self::new(rand::random(), rand::random(), rand::random())
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn apply(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::Flush => {
                self.buffer.clear();
                self.marker_pending = true;
            }
            PlaybackCommand::Audio(samples) => {
                if samples.is_empty() {
                    return;
                }
                if self.buffer.len() + samples.len() > MAX_BUFFERED_SAMPLES {
                    debug!(
                        "Playback buffer over {} samples, dropping {} buffered",
                        MAX_BUFFERED_SAMPLES,
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                self.buffer.extend_from_slice(&samples);
            }
        }
    }

    /// Next 20 ms frame: buffered audio when a full frame is available,
    /// μ-law silence otherwise.
    pub fn next_packet(&mut self) -> RtpPacket {
        let payload = if self.buffer.len() >= FRAME_SAMPLES {
            let frame: Vec<i16> = self.buffer.drain(..FRAME_SAMPLES).collect();
            PcmuCodec::encode(&frame)
        } else {
            Bytes::from(vec![MULAW_SILENCE; FRAME_SAMPLES])
        };

        let mut packet = RtpPacket::new(
            PCMU_PAYLOAD_TYPE,
            self.sequence,
            self.timestamp,
            self.ssrc,
            payload,
        );
        packet.set_marker(self.marker_pending);

        self.marker_pending = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(FRAME_SAMPLES as u32);
        packet
    }
}

pub struct PlaybackWorker {
    socket: Arc<UdpSocket>,
    commands: mpsc::Receiver<PlaybackCommand>,
    peer: watch::Receiver<Option<SocketAddr>>,
    state: PlaybackState,
}

impl PlaybackWorker {
    pub fn new(
        socket: Arc<UdpSocket>,
        commands: mpsc::Receiver<PlaybackCommand>,
        peer: watch::Receiver<Option<SocketAddr>>,
    ) -> Self {
        Self::with_state(socket, commands, peer, PlaybackState::random())
    }

    pub fn with_state(
        socket: Arc<UdpSocket>,
        commands: mpsc::Receiver<PlaybackCommand>,
        peer: watch::Receiver<Option<SocketAddr>>,
        state: PlaybackState,
    ) -> Self {
        Self {
            socket,
            commands,
            peer,
            state,
        }
    }

    /// Pace frames until cancelled. Ticks before the peer is known send
    /// nothing; a send failure ends the worker.
    pub async fn run(mut self, cancel: CancellationToken) -> io::Result<()> {
        let mut ticker = interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        info!("Playback worker started, ssrc={:08x}", self.state.ssrc);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Playback worker stopped");
                    return Ok(());
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.state.apply(command),
                    None => commands_open = false,
                },
                _ = ticker.tick() => {
                    let peer = *self.peer.borrow();
                    let Some(peer) = peer else { continue };
                    let packet = self.state.next_packet();
                    self.socket.send_to(&packet.serialize(), peer).await?;
                }
            }
        }
    }
}
