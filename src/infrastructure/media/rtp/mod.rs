//! RTP packets as carried on a call's media socket

pub mod packet;

pub use packet::{RtpError, RtpPacket};
