//! SIP Digest Authentication client side (RFC 2617, qop=auth)

use super::builder::random_hex;
use super::message::SipError;
use std::collections::HashMap;

/// Authentication challenge taken from `WWW-Authenticate` or
/// `Proxy-Authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: String,
    pub qop: String,
}

impl DigestChallenge {
    pub fn parse(value: &str) -> Result<Self, SipError> {
        let value = value.trim();
        let rest = match value.get(..6) {
            Some(scheme) if scheme.eq_ignore_ascii_case("digest") => &value[6..],
            _ => {
                return Err(SipError::Authentication(format!(
                    "unsupported auth scheme: {}",
                    value
                )))
            }
        };

        let params = parse_digest_params(rest);

        let realm = params
            .get("realm")
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?
            .to_string();
        let nonce = params
            .get("nonce")
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?
            .to_string();

        Ok(Self {
            realm,
            nonce,
            opaque: params.get("opaque").map(|s| s.to_string()),
            algorithm: params
                .get("algorithm")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop: params
                .get("qop")
                .filter(|s| !s.is_empty())
                .cloned()
                .unwrap_or_else(|| "auth".to_string()),
        })
    }
}

/// Split `key=value` pairs on commas, trimming quotes. Keys are lower-cased.
fn parse_digest_params(params: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in params.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            out.insert(key, value.to_string());
        }
    }
    out
}

/// Build an `Authorization` value with a fresh cnonce.
pub fn build_authorization(
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
    nc: u32,
) -> String {
    build_authorization_with_cnonce(
        method,
        uri,
        username,
        password,
        challenge,
        nc,
        &random_hex(16),
    )
}

pub fn build_authorization_with_cnonce(
    method: &str,
    uri: &str,
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
    nc: u32,
    cnonce: &str,
) -> String {
    let nc = format!("{:08x}", nc);
    let response = calculate_response(
        username,
        password,
        &challenge.realm,
        method,
        uri,
        &challenge.nonce,
        &nc,
        cnonce,
        &challenge.qop,
    );

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}, cnonce="{}", nc={}, qop={}"#,
        username,
        challenge.realm,
        challenge.nonce,
        uri,
        response,
        challenge.algorithm,
        cnonce,
        nc,
        challenge.qop
    );
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    value
}

/// MD5(HA1:nonce:nc:cnonce:qop:HA2)
#[allow(clippy::too_many_arguments)]
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    md5_hex(&format!(
        "{}:{}:{}:{}:{}:{}",
        ha1, nonce, nc, cnonce, qop, ha2
    ))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
