//! G.711 companding for RTP payload types 0 (PCMU, μ-law) and 8 (PCMA, A-law)
//!
//! One byte per sample at 8 kHz, so a 20 ms frame is 160 bytes.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Type {
    PCMU,
    PCMA,
}

impl G711Type {
    pub fn payload_type(&self) -> u8 {
        match self {
            G711Type::PCMU => 0,
            G711Type::PCMA => 8,
        }
    }

    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(G711Type::PCMU),
            8 => Some(G711Type::PCMA),
            _ => None,
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Vec<i16> {
        match self {
            G711Type::PCMU => PcmuCodec::decode(payload),
            G711Type::PCMA => PcmaCodec::decode(payload),
        }
    }
}

/// Decode an RTP payload by payload type. Unsupported types yield `None`.
pub fn decode_payload(payload_type: u8, payload: &[u8]) -> Option<Vec<i16>> {
    G711Type::from_payload_type(payload_type).map(|codec| codec.decode(payload))
}

pub struct PcmuCodec;

impl PcmuCodec {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    pub fn encode(pcm: &[i16]) -> Bytes {
        pcm.iter().map(|&s| linear_to_mulaw(s)).collect::<Vec<u8>>().into()
    }

    pub fn decode(ulaw: &[u8]) -> Vec<i16> {
        ulaw.iter().map(|&b| mulaw_to_linear(b)).collect()
    }
}

pub struct PcmaCodec;

impl PcmaCodec {
    pub fn encode(pcm: &[i16]) -> Bytes {
        pcm.iter().map(|&s| linear_to_alaw(s)).collect::<Vec<u8>>().into()
    }

    pub fn decode(alaw: &[u8]) -> Vec<i16> {
        alaw.iter().map(|&b| alaw_to_linear(b)).collect()
    }
}

/// Index of the first segment end that is >= `value`, or 8 when beyond all.
fn segment(value: i32, ends: &[i32; 8]) -> i32 {
    ends.iter()
        .position(|&end| value <= end)
        .map(|seg| seg as i32)
        .unwrap_or(8)
}

const ULAW_SEG_END: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];
const ALAW_SEG_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let mask: i32 = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    if pcm > PcmuCodec::CLIP {
        pcm = PcmuCodec::CLIP;
    }
    pcm += PcmuCodec::BIAS;

    let seg = segment(pcm, &ULAW_SEG_END);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let uval = (seg << 4) | ((pcm >> (seg + 3)) & 0x0F);
    (uval ^ mask) as u8
}

pub fn mulaw_to_linear(byte: u8) -> i16 {
    let u = !byte as i32;
    let mut t = ((u & 0x0F) << 3) + PcmuCodec::BIAS;
    t <<= (u & 0x70) >> 4;
    let value = if u & 0x80 != 0 {
        PcmuCodec::BIAS - t
    } else {
        t - PcmuCodec::BIAS
    };
    value as i16
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask: i32 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &ALAW_SEG_END);
    if seg >= 8 {
        return (0x7F ^ mask) as u8;
    }
    let mut aval = seg << 4;
    if seg < 2 {
        aval |= (pcm >> 1) & 0x0F;
    } else {
        aval |= (pcm >> seg) & 0x0F;
    }
    (aval ^ mask) as u8
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = (byte ^ 0x55) as i32;
    let mut t = (a & 0x0F) << 4;
    let seg = (a & 0x70) >> 4;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    let value = if a & 0x80 != 0 { t } else { -t };
    value as i16
}
