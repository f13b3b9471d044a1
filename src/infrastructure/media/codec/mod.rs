//! G.711 payload codecs

pub mod g711;

pub use g711::{decode_payload, G711Type, PcmaCodec, PcmuCodec};
