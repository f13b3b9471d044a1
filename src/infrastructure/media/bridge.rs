//! WebSocket bridge between a call and an AI audio backend
//!
//! Uplink: caller RTP (PCMU/PCMA @ 8 kHz) is decoded, upsampled to 16 kHz and
//! sent as little-endian binary frames. Downlink: `streamAudio` text frames
//! are decoded, brought to 8 kHz and queued on the playback worker.

use super::codec::decode_payload;
use super::playback::{PlaybackCommand, PlaybackWorker, COMMAND_QUEUE_DEPTH};
use super::rtp::RtpPacket;
use super::stream::{run_drain, READ_TIMEOUT};
use super::MediaContext;
use crate::domain::agent::is_stream_url;
use crate::domain::audio::{
    decode_stream_audio, downsample_to_8k, mean_square, samples_to_pcm16le, startup_beep,
    upsample_8k_to_16k, UPLINK_RATE,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a downstream chunk waits for the caller's RTP address
pub const PEER_WAIT: Duration = Duration::from_secs(3);

const METADATA_SOURCE: &str = "sip-ai-bridge";
const UPLINK_MIME_TYPE: &str = "audio/pcm;rate=16000";
const DIAGNOSTIC_SAMPLES: usize = 800;
const MAX_RTP_DATAGRAM: usize = 2048;

/// When downstream audio should clear whatever is still queued for playback.
///
/// With a minimum rate set, the first chunk whose declared sample rate reaches
/// it flushes the playback buffer once, so the AI's voice starts immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    min_rate: Option<u32>,
}

impl FlushPolicy {
    /// `0` disables flushing.
    pub fn from_min_rate(min_rate: u32) -> Self {
        Self {
            min_rate: (min_rate > 0).then_some(min_rate),
        }
    }

    pub fn disabled() -> Self {
        Self { min_rate: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.min_rate.is_some()
    }

    pub fn triggers(&self, declared_rate: u32) -> bool {
        self.min_rate.map_or(false, |min| declared_rate >= min)
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_min_rate(16000)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamMetadata<'a> {
    source: &'a str,
    call_id: &'a str,
    extension: &'a str,
    mime_type: &'a str,
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: StreamAudio,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamAudio {
    #[serde(default)]
    audio_data_type: String,
    #[serde(default)]
    sample_rate: i64,
    #[serde(default)]
    audio_data: String,
}

/// One downstream chunk, already at 8 kHz
#[derive(Debug, Clone, PartialEq)]
pub struct DownstreamChunk {
    pub data_type: String,
    /// Rate announced by the backend, `0` when absent
    pub declared_rate: u32,
    pub samples: Vec<i16>,
}

/// Decode a `streamAudio` text frame. Anything else, and chunks that end up
/// with no 8 kHz samples, give `None`.
pub fn decode_stream_frame(text: &str) -> Option<DownstreamChunk> {
    let message: StreamMessage = serde_json::from_str(text).ok()?;
    if message.kind != "streamAudio" {
        return None;
    }

    let data_type = message.data.audio_data_type.trim().to_ascii_lowercase();
    let declared_rate = message.data.sample_rate.clamp(0, u32::MAX as i64) as u32;
    let chunk = match decode_stream_audio(&data_type, declared_rate, &message.data.audio_data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!("Dropping {} chunk: {}", data_type, e);
            return None;
        }
    };

    let samples = downsample_to_8k(&chunk.samples, chunk.sample_rate);
    if samples.is_empty() {
        debug!(
            "Dropping {} chunk at unsupported rate {}",
            data_type, chunk.sample_rate
        );
        return None;
    }

    Some(DownstreamChunk {
        data_type,
        declared_rate,
        samples,
    })
}

/// Reads backend frames and feeds the playback worker
pub struct DownstreamConsumer {
    call_id: String,
    flush: FlushPolicy,
    flushed: bool,
    logged: bool,
    commands: mpsc::Sender<PlaybackCommand>,
    peer: watch::Receiver<Option<SocketAddr>>,
}

impl DownstreamConsumer {
    pub fn new(
        call_id: impl Into<String>,
        flush: FlushPolicy,
        commands: mpsc::Sender<PlaybackCommand>,
        peer: watch::Receiver<Option<SocketAddr>>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            flush,
            flushed: false,
            logged: false,
            commands,
            peer,
        }
    }

    /// Run until the stream ends, fails, or the bridge is cancelled.
    pub async fn run<S>(mut self, mut stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => {
                    if !self.handle_text(&text, &cancel).await {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Stream closed by backend call-id={} {:?}", self.call_id, frame);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Stream read failed call-id={}: {}", self.call_id, e);
                    return;
                }
                None => {
                    info!("Stream ended call-id={}", self.call_id);
                    return;
                }
            }
        }
    }

    /// Returns `false` once the bridge is cancelled.
    async fn handle_text(&mut self, text: &str, cancel: &CancellationToken) -> bool {
        let Some(chunk) = decode_stream_frame(text) else {
            return true;
        };

        if !self.flushed && self.flush.triggers(chunk.declared_rate) {
            self.flushed = true;
            self.enqueue(PlaybackCommand::Flush);
        }

        if !self.logged {
            self.logged = true;
            let head = &chunk.samples[..chunk.samples.len().min(DIAGNOSTIC_SAMPLES)];
            info!(
                "First backend audio call-id={} type={} rate={} samples8k={} ms={:.0}",
                self.call_id,
                chunk.data_type,
                chunk.declared_rate,
                chunk.samples.len(),
                mean_square(head)
            );
        }

        let peer_known = tokio::select! {
            _ = cancel.cancelled() => return false,
            known = wait_for_peer(&mut self.peer) => known,
        };
        if !peer_known {
            debug!("No RTP peer yet call-id={}, dropping chunk", self.call_id);
            return true;
        }

        self.enqueue(PlaybackCommand::Audio(chunk.samples));
        true
    }

    fn enqueue(&self, command: PlaybackCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Playback queue full call-id={}, dropping", self.call_id)
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Playback worker gone call-id={}", self.call_id)
            }
        }
    }
}

async fn wait_for_peer(peer: &mut watch::Receiver<Option<SocketAddr>>) -> bool {
    let wait = async { peer.wait_for(Option::is_some).await.is_ok() };
    timeout(PEER_WAIT, wait).await.unwrap_or(false)
}

/// Why the uplink stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkEnd {
    Cancelled,
    /// Writing to or reading from the backend failed
    StreamClosed,
}

/// Forward caller audio to the backend and publish the caller's RTP address.
pub async fn run_uplink<S>(
    ctx: &MediaContext,
    sink: &mut S,
    peer: &watch::Sender<Option<SocketAddr>>,
    cancel: &CancellationToken,
) -> io::Result<UplinkEnd>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let mut buf = vec![0u8; MAX_RTP_DATAGRAM];
    let mut first_frame_logged = false;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(UplinkEnd::Cancelled),
            received = timeout(READ_TIMEOUT, ctx.socket.recv_from(&mut buf)) => received,
        };
        let (size, from) = match received {
            Err(_) => continue,
            Ok(result) => result?,
        };

        let packet = match RtpPacket::parse(&buf[..size]) {
            Ok(packet) => packet,
            Err(_) => continue,
        };
        peer.send_if_modified(|current| {
            let changed = *current != Some(from);
            *current = Some(from);
            changed
        });

        if packet.payload.is_empty() {
            continue;
        }
        let Some(pcm8k) = decode_payload(packet.payload_type, &packet.payload) else {
            continue;
        };
        let frame = samples_to_pcm16le(&upsample_8k_to_16k(&pcm8k));
        let frame_len = frame.len();

        if let Err(e) = sink.send(Message::Binary(frame)).await {
            warn!("Stream write failed call-id={}: {}", ctx.call_id, e);
            return Ok(UplinkEnd::StreamClosed);
        }
        if !first_frame_logged {
            first_frame_logged = true;
            info!(
                "First uplink frame call-id={} bytes={} pt={}",
                ctx.call_id, frame_len, packet.payload_type
            );
        }
    }
}

/// Bridge the call to `url`. Connection problems and a lost backend fall
/// back to draining the socket until the call is torn down.
pub async fn run_bridged(ctx: &MediaContext, url: &str, flush: FlushPolicy) -> io::Result<()> {
    if !is_stream_url(url) {
        warn!("Bad stream url {:?} call-id={}, draining", url, ctx.call_id);
        return run_drain(ctx).await;
    }

    let connected = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(()),
        connected = timeout(CONNECT_TIMEOUT, connect_async(url)) => connected,
    };
    let ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!("Stream dial failed url={} call-id={}: {}, draining", url, ctx.call_id, e);
            return run_drain(ctx).await;
        }
        Err(_) => {
            warn!("Stream dial timed out url={} call-id={}, draining", url, ctx.call_id);
            return run_drain(ctx).await;
        }
    };
    info!(
        "Stream connected url={} ext={} call-id={}",
        url, ctx.extension, ctx.call_id
    );

    let (mut sink, stream) = ws.split();

    let metadata = serde_json::to_string(&StreamMetadata {
        source: METADATA_SOURCE,
        call_id: &ctx.call_id,
        extension: &ctx.extension,
        mime_type: UPLINK_MIME_TYPE,
        sample_rate: UPLINK_RATE,
    })?;
    if let Err(e) = sink.send(Message::Text(metadata)).await {
        warn!("Stream metadata write failed call-id={}: {}, draining", ctx.call_id, e);
        return run_drain(ctx).await;
    }

    let bridge_cancel = ctx.cancel.child_token();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (peer_tx, peer_rx) = watch::channel(None);

    if command_tx
        .try_send(PlaybackCommand::Audio(startup_beep()))
        .is_err()
    {
        debug!("Beep not queued call-id={}", ctx.call_id);
    }

    let playback = tokio::spawn(
        PlaybackWorker::new(ctx.socket.clone(), command_rx, peer_rx.clone())
            .run(bridge_cancel.clone()),
    );
    let mut consumer = tokio::spawn(
        DownstreamConsumer::new(ctx.call_id.clone(), flush, command_tx, peer_rx)
            .run(stream, bridge_cancel.clone()),
    );

    // The consumer only returns early when the backend stream is gone
    let mut consumer_joined = None;
    let outcome = tokio::select! {
        outcome = run_uplink(ctx, &mut sink, &peer_tx, &bridge_cancel) => outcome,
        joined = &mut consumer => {
            consumer_joined = Some(joined);
            if ctx.cancel.is_cancelled() {
                Ok(UplinkEnd::Cancelled)
            } else {
                Ok(UplinkEnd::StreamClosed)
            }
        }
    };

    bridge_cancel.cancel();
    let _ = sink.close().await;
    match playback.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Playback worker failed call-id={}: {}", ctx.call_id, e),
        Err(e) => warn!("Playback worker panicked call-id={}: {}", ctx.call_id, e),
    }
    let joined = match consumer_joined {
        Some(joined) => joined,
        None => consumer.await,
    };
    if let Err(e) = joined {
        warn!("Stream consumer panicked call-id={}: {}", ctx.call_id, e);
    }

    match outcome? {
        UplinkEnd::Cancelled => Ok(()),
        UplinkEnd::StreamClosed => {
            info!("Stream lost call-id={}, draining", ctx.call_id);
            run_drain(ctx).await
        }
    }
}
