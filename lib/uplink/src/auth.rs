//! Handshake bodies and the opaque bearer credential they produce. The
//! token is never interpreted, only stored and replayed; rotation happens
//! whenever the backend answers 401 or a config update forces it.

use crate::error::{FatalCause, SyncError, SyncResult};
use flint::choose;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: u64,
}

#[derive(Serialize)]
struct HandshakeRequest<'a> {
    device_id: &'a str,
    timestamp: u64,
}

pub fn handshake_body(device_id: &str, timestamp: u64) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(&HandshakeRequest {
        device_id,
        timestamp,
    })
    .map_err(|_| SyncError::Fatal(FatalCause::BadPayload))
}

pub fn parse_handshake(body: &[u8]) -> SyncResult<Credential> {
    serde_json::from_slice(body).map_err(|_| SyncError::Fatal(FatalCause::BadPayload))
}

pub struct AuthState {
    credential: Option<Credential>,
}

impl AuthState {
    #[inline]
    pub fn new() -> AuthState {
        AuthState { credential: None }
    }

    #[inline]
    pub fn bearer(&self) -> Option<&str> {
        self.credential
            .as_ref()
            .map(|credential| credential.token.as_str())
    }

    #[inline]
    pub fn install(&mut self, credential: Credential) {
        self.credential = Some(credential);
    }

    /// Drops the credential; the next sync step must handshake first.
    #[inline]
    pub fn invalidate(&mut self) {
        self.credential = None;
    }

    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }
}

/// Log-safe rendering of a token: everything but the tail is masked.
pub fn protect_token(token: &str) -> String {
    let visible_from = token.len().saturating_sub(4);

    token
        .chars()
        .enumerate()
        .map(|(index, chr)| choose!(index < visible_from => '*', chr))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_body_shape() {
        let body = handshake_body("edge-0042", 1_700_000_123).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["device_id"], "edge-0042");
        assert_eq!(value["timestamp"], 1_700_000_123);
    }

    #[test]
    fn test_parse_handshake() {
        let credential =
            parse_handshake(br#"{"token":"tok-abcdef","expires_at":1700003600}"#).unwrap();

        assert_eq!(credential.token, "tok-abcdef");
        assert_eq!(credential.expires_at, 1_700_003_600);

        assert_eq!(
            parse_handshake(br#"{"nope":true}"#),
            Err(SyncError::Fatal(FatalCause::BadPayload))
        );
    }

    #[test]
    fn test_auth_state_lifecycle() {
        let mut auth = AuthState::new();

        assert!(!auth.is_authenticated());
        assert_eq!(auth.bearer(), None);

        auth.install(Credential {
            token: "tok-1".to_string(),
            expires_at: 0,
        });

        assert_eq!(auth.bearer(), Some("tok-1"));

        auth.invalidate();
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn test_protect_token_masks_all_but_tail() {
        assert_eq!(protect_token("tok-abcdef"), "******cdef");
        assert_eq!(protect_token("abc"), "abc");
    }
}
