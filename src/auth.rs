//! Password handshake. The client opens with AUTH_REQUEST carrying the
//! SHA-256 digest of the shared password plus its identity; the server
//! answers with AUTH_SUCCESS (session token + identity) or AUTH_FAILURE.
//! Exactly one attempt is permitted per connection.
//!
//! The digest scheme is deliberately the documented on-wire contract: a bare
//! SHA-256 of a shared secret. Deploy on trusted networks or wrap the stream
//! in TLS at a lower layer.

use crate::payload::{self, map};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rmpv::Value;
use sha2::{Digest, Sha256};

pub const SESSION_TOKEN_LEN: usize = 32;

/// Identity record exchanged during the handshake.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerInfo {
    pub name: String,
    pub version: String,
}

impl PeerInfo {
    pub fn new<S: Into<String>>(name: S) -> PeerInfo {
        PeerInfo {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        map(vec![
            ("name", Value::String(self.name.clone().into())),
            ("version", Value::String(self.version.clone().into())),
        ])
    }

    pub fn from_value(value: &Value) -> Option<PeerInfo> {
        Some(PeerInfo {
            name: payload::get_str(value, "name")?.to_string(),
            version: payload::get_str(value, "version")?.to_string(),
        })
    }
}

/// Lowercase hex SHA-256 of the shared password.
pub fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Compares two digests without short-circuiting on the first mismatch.
pub fn verify_digest(expected: &str, presented: &str) -> bool {
    if expected.len() != presented.len() {
        return false;
    }

    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Random opaque session token issued with AUTH_SUCCESS.
pub fn mint_session_token<R: Rng>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub fn auth_request(digest: &str, info: &PeerInfo) -> Value {
    map(vec![
        ("password_hash", Value::String(digest.into())),
        ("client_info", info.to_value()),
    ])
}

pub fn parse_auth_request(value: &Value) -> Option<(String, PeerInfo)> {
    let digest = payload::get_str(value, "password_hash")?.to_string();
    let info = PeerInfo::from_value(payload::get(value, "client_info")?)?;

    Some((digest, info))
}

pub fn auth_success(token: &str, info: &PeerInfo) -> Value {
    map(vec![
        ("session_token", Value::String(token.into())),
        ("server_info", info.to_value()),
    ])
}

pub fn parse_auth_success(value: &Value) -> Option<(String, PeerInfo)> {
    let token = payload::get_str(value, "session_token")?.to_string();
    let info = PeerInfo::from_value(payload::get(value, "server_info")?)?;

    Some((token, info))
}

pub fn auth_failure(reason: &str, retry_allowed: bool) -> Value {
    map(vec![
        ("reason", Value::String(reason.into())),
        ("retry_allowed", Value::Boolean(retry_allowed)),
    ])
}

pub fn parse_auth_failure(value: &Value) -> (String, bool) {
    let reason = payload::get_str(value, "reason").unwrap_or("authentication rejected").to_string();
    let retry_allowed = payload::get_bool(value, "retry_allowed").unwrap_or(false);

    (reason, retry_allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = password_digest("hunter2");

        assert_eq!(digest.len(), 64);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(digest, password_digest("hunter2"));
        assert_ne!(digest, password_digest("hunter3"));
    }

    #[test]
    fn test_verify_digest() {
        let digest = password_digest("secret");

        assert!(verify_digest(&digest, &password_digest("secret")));
        assert!(!verify_digest(&digest, &password_digest("Secret")));
        assert!(!verify_digest(&digest, "short"));
    }

    #[test]
    fn test_session_token_shape() {
        let mut rng = rand::thread_rng();

        let token = mint_session_token(&mut rng);
        assert_eq!(token.len(), SESSION_TOKEN_LEN);
        assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));

        assert_ne!(token, mint_session_token(&mut rng));
    }

    #[test]
    fn test_auth_request_roundtrip() {
        let info = PeerInfo::new("test-client");
        let digest = password_digest("hunter2");

        let value = auth_request(&digest, &info);
        let (parsed_digest, parsed_info) = parse_auth_request(&value).unwrap();

        assert_eq!(parsed_digest, digest);
        assert_eq!(parsed_info, info);
    }

    #[test]
    fn test_auth_success_roundtrip() {
        let info = PeerInfo::new("test-server");

        let value = auth_success("tok123", &info);
        let (token, parsed_info) = parse_auth_success(&value).unwrap();

        assert_eq!(token, "tok123");
        assert_eq!(parsed_info, info);
    }

    #[test]
    fn test_auth_failure_defaults() {
        let value = auth_failure("bad password", false);
        let (reason, retry) = parse_auth_failure(&value);

        assert_eq!(reason, "bad password");
        assert!(!retry);

        // Malformed payloads fall back to a terminal failure.
        let (_, retry) = parse_auth_failure(&payload::empty());
        assert!(!retry);
    }

    #[test]
    fn test_malformed_request_rejected() {
        assert!(parse_auth_request(&payload::empty()).is_none());

        let missing_info = map(vec![("password_hash", Value::String("abc".into()))]);
        assert!(parse_auth_request(&missing_info).is_none());
    }
}
