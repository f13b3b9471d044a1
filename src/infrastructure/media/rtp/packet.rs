//! RTP packets (RFC 3550) as a G.711 endpoint sees them
//!
//! CSRC lists and header extensions are skipped on parse and padding is
//! stripped. Packets we send always carry the bare 12-byte header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

const RTP_VERSION: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub const HEADER_LEN: usize = 12;

    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < Self::HEADER_LEN {
            return Err(RtpError::Truncated);
        }
        let mut buf = data;

        let first = buf.get_u8();
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(RtpError::BadVersion(version));
        }
        let has_padding = first & 0x20 != 0;
        let has_extension = first & 0x10 != 0;
        let csrc_len = (first & 0x0F) as usize * 4;

        let second = buf.get_u8();
        let sequence = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        skip(&mut buf, csrc_len)?;
        if has_extension {
            if buf.remaining() < 4 {
                return Err(RtpError::Truncated);
            }
            let _profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            skip(&mut buf, words * 4)?;
        }

        let mut end = buf.len();
        if has_padding {
            let pad = *buf.last().ok_or(RtpError::BadPadding)? as usize;
            if pad == 0 || pad > end {
                return Err(RtpError::BadPadding);
            }
            end -= pad;
        }

        Ok(Self {
            marker: second & 0x80 != 0,
            payload_type: second & 0x7F,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&buf[..end]),
        })
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn set_marker(&mut self, marker: bool) {
        self.marker = marker;
    }

    /// Same payload type, sequence, timestamp, marker and payload under
    /// our own SSRC.
    pub fn echo_reply(&self, ssrc: u32) -> Self {
        Self {
            ssrc,
            ..self.clone()
        }
    }
}

fn skip(buf: &mut &[u8], len: usize) -> Result<(), RtpError> {
    if buf.remaining() < len {
        return Err(RtpError::Truncated);
    }
    buf.advance(len);
    Ok(())
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pt={} seq={} ts={} ssrc={:08x} m={} len={}",
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            self.marker as u8,
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtpError {
    #[error("RTP packet truncated")]
    Truncated,
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("bad RTP padding")]
    BadPadding,
}
