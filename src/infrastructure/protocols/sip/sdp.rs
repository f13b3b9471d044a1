//! Simple SDP (Session Description Protocol) handling

use std::fmt;
use std::net::IpAddr;

/// Audio answer offered on every accepted call
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub address: IpAddr,
    pub session_name: String,
    pub media: SdpMedia,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub port: u16,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<(u8, &'static str)>,
    pub fmtp: Vec<(u8, &'static str)>,
    pub ptime: u32,
}

impl SdpSession {
    /// PCMU, PCMA and telephone-event at 8 kHz, 20 ms packets.
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        Self {
            address: local_ip,
            session_name: "sip-ai-bridge".to_string(),
            media: SdpMedia {
                port: local_port,
                formats: vec![0, 8, 101],
                rtpmap: vec![
                    (0, "PCMU/8000"),
                    (8, "PCMA/8000"),
                    (101, "telephone-event/8000"),
                ],
                fmtp: vec![(101, "0-16")],
                ptime: 20,
            },
        }
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr_type = if self.address.is_ipv4() { "IP4" } else { "IP6" };

        write!(f, "v=0\r\n")?;
        write!(f, "o=- 0 0 IN {} {}\r\n", addr_type, self.address)?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(f, "c=IN {} {}\r\n", addr_type, self.address)?;
        write!(f, "t=0 0\r\n")?;

        write!(f, "m=audio {} RTP/AVP", self.media.port)?;
        for format in &self.media.formats {
            write!(f, " {}", format)?;
        }
        write!(f, "\r\n")?;
        for (pt, encoding) in &self.media.rtpmap {
            write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
        }
        for (pt, params) in &self.media.fmtp {
            write!(f, "a=fmtp:{} {}\r\n", pt, params)?;
        }
        write!(f, "a=ptime:{}\r\n", self.media.ptime)?;
        write!(f, "a=sendrecv\r\n")
    }
}

/// Remote audio endpoint announced in an SDP offer (`c=` address and the
/// first `m=audio` port). Used for logging only; media flows to wherever RTP
/// actually arrives from.
pub fn remote_audio_endpoint(sdp_body: &str) -> Option<(String, u16)> {
    let mut address = None;
    let mut port = None;

    for line in sdp_body.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("c=") {
            if address.is_none() {
                address = value.split_whitespace().nth(2).map(|s| s.to_string());
            }
        } else if let Some(value) = line.strip_prefix("m=audio ") {
            if port.is_none() {
                port = value.split_whitespace().next().and_then(|p| p.parse().ok());
            }
        }
    }

    Some((address?, port?))
}

/// Answer body for an accepted call.
pub fn build_sdp(ip: IpAddr, rtp_port: u16) -> String {
    SdpSession::create_audio_session(ip, rtp_port).to_string()
}
