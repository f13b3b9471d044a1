//! SIP message types and parsing
//!
//! The parser is deliberately lenient: the peer is a PBX whose framing we have
//! already observed, so bare-LF line endings are accepted and header lines
//! without a colon are skipped instead of failing the whole datagram.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// SIP method types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    /// Case-insensitive lookup; unknown methods map to `None`.
    pub fn parse(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered header list with case-insensitive, multi-valued lookup.
///
/// Names are stored lower-cased. Order of appearance is kept so that repeated
/// headers such as `Via` can be mirrored back exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order of appearance.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// SIP Request
#[derive(Debug, Clone)]
pub struct SipRequest {
    method: String,
    uri: String,
    headers: Headers,
    body: Bytes,
}

impl SipRequest {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Request(request) => Ok(request),
            SipMessage::Response(_) => Err(SipError::InvalidMessage(
                "expected a request, got a response".to_string(),
            )),
        }
    }

    /// Known method, or `None` for anything this agent does not implement.
    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::parse(&self.method)
    }

    /// Method token exactly as received.
    pub fn method_str(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers.get_all(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id").filter(|v| !v.is_empty())
    }

    /// User part of the `To` URI when it is made of digits only.
    ///
    /// The user ends at the first `@`, `;` or `>` after `sip:`.
    pub fn to_user(&self) -> Option<String> {
        let to = self.header("to")?;
        let start = to.to_ascii_lowercase().find("sip:")? + 4;
        let rest = &to[start..];
        let end = rest
            .find(|c| c == '@' || c == ';' || c == '>')
            .unwrap_or(rest.len());
        let user = rest[..end].trim();
        if is_digits(user) {
            Some(user.to_string())
        } else {
            None
        }
    }
}

/// SIP Response
#[derive(Debug, Clone)]
pub struct SipResponse {
    status_code: u16,
    reason: String,
    headers: Headers,
    body: Bytes,
}

impl SipResponse {
    pub fn new(status_code: u16, reason: &str, headers: Headers, body: Bytes) -> Self {
        Self {
            status_code,
            reason: reason.to_string(),
            headers,
            body,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        match SipMessage::parse(data)? {
            SipMessage::Response(response) => Ok(response),
            SipMessage::Request(_) => Err(SipError::InvalidMessage(
                "expected a response, got a request".to_string(),
            )),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers.get_all(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(256 + self.body.len());
        out.push_str(&format!("SIP/2.0 {} {}\r\n", self.status_code, self.reason));
        for (name, value) in self.headers.iter() {
            out.push_str(&format!("{}: {}\r\n", canonical_name(name), value));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }
}

/// Split at the first blank line, CRLF first then bare LF. The body is left
/// exactly as received.
fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    let find = |needle: &[u8]| data.windows(needle.len()).position(|w| w == needle);
    match find(b"\r\n\r\n") {
        Some(idx) => (&data[..idx], &data[idx + 4..]),
        None => match find(b"\n\n") {
            Some(idx) => (&data[..idx], &data[idx + 2..]),
            None => (data, &[]),
        },
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let (head, body) = split_head_body(data);
        let head = String::from_utf8_lossy(head);

        let mut lines = head.split('\n');
        let start_line = lines.next().unwrap_or("").trim_end_matches('\r');
        if start_line.trim().is_empty() {
            return Err(SipError::ParseError("empty message".to_string()));
        }

        let mut headers = Headers::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push(name, value);
            }
        }

        let mut body = body;
        if let Some(declared) = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if declared <= body.len() {
                body = &body[..declared];
            }
        }
        let body = Bytes::copy_from_slice(body);

        let fields: Vec<&str> = start_line.split_whitespace().collect();
        if start_line.starts_with("SIP/2.0 ") {
            if fields.len() < 3 {
                return Err(SipError::ParseError(format!(
                    "bad status line: {:?}",
                    start_line
                )));
            }
            let status_code = fields[1]
                .parse::<u16>()
                .ok()
                .filter(|code| (100..=999).contains(code))
                .ok_or_else(|| {
                    SipError::ParseError(format!("bad status code: {:?}", start_line))
                })?;
            Ok(SipMessage::Response(SipResponse {
                status_code,
                reason: fields[2..].join(" "),
                headers,
                body,
            }))
        } else {
            if fields.len() < 3 {
                return Err(SipError::ParseError(format!(
                    "bad request line: {:?}",
                    start_line
                )));
            }
            Ok(SipMessage::Request(SipRequest {
                method: fields[0].to_string(),
                uri: fields[1].to_string(),
                headers,
                body,
            }))
        }
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }
}

pub(crate) fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Wire spelling for a lower-cased header name.
fn canonical_name(name: &str) -> String {
    match name {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        _ => name
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.as_request().is_some());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.uri(), "sip:registrar.example.com");
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(req.header("CSEQ"), Some("314159 REGISTER"));
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 401 Unauthorized\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     WWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\
                     CSeq: 1 REGISTER\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 401);
        assert_eq!(resp.reason(), "Unauthorized");
        assert_eq!(
            resp.header("www-authenticate"),
            Some("Digest realm=\"r\", nonce=\"n\"")
        );
    }

    #[test]
    fn test_multiple_via_kept_in_order() {
        let data = b"OPTIONS sip:1001@pbx SIP/2.0\r\n\
                     Via: SIP/2.0/UDP a;branch=z9hG4bK1\r\n\
                     v: SIP/2.0/UDP ignored-compact-form\r\n\
                     VIA: SIP/2.0/UDP b;branch=z9hG4bK2\r\n\
                     via: SIP/2.0/UDP c;branch=z9hG4bK3\r\n\r\n";

        let req = SipRequest::parse(data).unwrap();
        assert_eq!(
            req.header_values("Via"),
            vec![
                "SIP/2.0/UDP a;branch=z9hG4bK1",
                "SIP/2.0/UDP b;branch=z9hG4bK2",
                "SIP/2.0/UDP c;branch=z9hG4bK3",
            ]
        );
    }

    #[test]
    fn test_bare_lf_and_malformed_lines() {
        let data = b"BYE sip:1001@pbx SIP/2.0\n\
                     Call-ID: abc\n\
                     this line has no colon\n\
                     CSeq: 2 BYE\n\nbody";

        let req = SipRequest::parse(data).unwrap();
        assert_eq!(req.method(), Some(SipMethod::Bye));
        assert_eq!(req.headers().len(), 2);
        assert_eq!(req.body(), b"body");
    }

    #[test]
    fn test_content_length_truncates_longer_body() {
        let data = b"INVITE sip:1001@pbx SIP/2.0\r\nContent-Length: 4\r\n\r\nv=0\r\ngarbage";
        let req = SipRequest::parse(data).unwrap();
        assert_eq!(req.body(), b"v=0\r");
    }

    #[test]
    fn test_binary_body_kept_byte_for_byte() {
        let mut data = b"MESSAGE sip:1001@pbx SIP/2.0\r\nContent-Length: 4\r\n\r\n".to_vec();
        data.extend_from_slice(&[0xFF, 0xFE, 0x00, 0x80, 0xC3]);
        let req = SipRequest::parse(&data).unwrap();
        assert_eq!(req.body(), &[0xFF, 0xFE, 0x00, 0x80][..]);
    }

    #[test]
    fn test_content_length_larger_than_body_keeps_body() {
        let data = b"INVITE sip:1001@pbx SIP/2.0\r\nContent-Length: 400\r\n\r\nv=0\r\n";
        let req = SipRequest::parse(data).unwrap();
        assert_eq!(req.body(), b"v=0\r\n");
    }

    #[test]
    fn test_bad_start_lines() {
        assert!(matches!(
            SipMessage::parse(b"INVITE sip:x\r\n\r\n"),
            Err(SipError::ParseError(_))
        ));
        assert!(matches!(
            SipMessage::parse(b"SIP/2.0 200\r\n\r\n"),
            Err(SipError::ParseError(_))
        ));
        assert!(matches!(
            SipMessage::parse(b"SIP/2.0 abc OK\r\n\r\n"),
            Err(SipError::ParseError(_))
        ));
        assert!(SipMessage::parse(b"").is_err());
    }

    #[test]
    fn test_to_user_extraction() {
        let req = SipRequest::parse(
            b"INVITE sip:1001@pbx SIP/2.0\r\nTo: \"Desk\" <sip:1001@10.0.0.1>\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.to_user(), Some("1001".to_string()));

        let req = SipRequest::parse(
            b"INVITE sip:alice@pbx SIP/2.0\r\nTo: <sip:alice@10.0.0.1>\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.to_user(), None);

        let req = SipRequest::parse(b"INVITE sip:1001@pbx SIP/2.0\r\nTo: <tel:1001>\r\n\r\n")
            .unwrap();
        assert_eq!(req.to_user(), None);
    }

    #[test]
    fn test_unknown_method_is_still_a_request() {
        let req = SipRequest::parse(b"SUBSCRIBE sip:1001@pbx SIP/2.0\r\n\r\n").unwrap();
        assert_eq!(req.method(), None);
        assert_eq!(req.method_str(), "SUBSCRIBE");
    }

    #[test]
    fn test_canonical_names() {
        assert_eq!(canonical_name("call-id"), "Call-ID");
        assert_eq!(canonical_name("content-length"), "Content-Length");
        assert_eq!(canonical_name("via"), "Via");
        assert_eq!(canonical_name("cseq"), "CSeq");
    }
}
