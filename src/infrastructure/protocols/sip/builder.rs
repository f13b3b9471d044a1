//! SIP response builder
//!
//! Responses mirror the dialog headers of the exact request they answer:
//! every `Via` in order, then `From`, `To`, `Call-ID` and `CSeq`.

use super::message::{Headers, SipMethod, SipRequest, SipResponse};
use bytes::Bytes;
use rand::Rng;

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to: Option<String>,
    contact: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to: None,
            contact: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    /// Replace the mirrored `To` value. Without an override the request's
    /// `To` is used, with a tag added when it has none.
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Only emitted on a 2xx answer to INVITE.
    pub fn contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> SipResponse {
        let mut headers = Headers::new();

        for via in request.header_values("via") {
            headers.push("via", via);
        }
        if let Some(from) = request.header("from") {
            headers.push("from", from);
        }
        match self.to {
            Some(to) => headers.push("to", &to),
            None => {
                if let Some(to) = request.header("to") {
                    headers.push("to", &ensure_to_tag(to));
                }
            }
        }
        if let Some(call_id) = request.header("call-id") {
            headers.push("call-id", call_id);
        }
        if let Some(cseq) = request.header("cseq") {
            headers.push("cseq", cseq);
        }
        let answers_invite = request.method() == Some(SipMethod::Invite)
            && (200..300).contains(&self.status_code);
        if let (Some(contact), true) = (self.contact, answers_invite) {
            headers.push("contact", &contact);
        }
        for (name, value) in &self.headers {
            headers.push(name, value);
        }
        headers.push("content-length", &self.body.len().to_string());

        SipResponse::new(
            self.status_code,
            reason_phrase(self.status_code),
            headers,
            Bytes::from(self.body),
        )
    }
}

/// Standard reason phrase for the status codes this agent emits.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// Random lowercase hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..(len + 1) / 2).map(|_| rng.gen()).collect();
    let mut out = hex::encode(bytes);
    out.truncate(len);
    out
}

/// Return `to` unchanged when it already carries a `tag` parameter,
/// otherwise append a freshly generated one.
pub fn ensure_to_tag(to: &str) -> String {
    if to.to_ascii_lowercase().contains(";tag=") {
        to.to_string()
    } else {
        format!("{};tag={}", to, random_hex(10))
    }
}
