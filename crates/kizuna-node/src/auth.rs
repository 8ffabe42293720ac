//! Bearer-key check for the control plane.
//!
//! Both sides are hashed before comparison so the equality check is
//! constant-time and independent of the provided key's length.

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time equality of the configured and the provided key.
pub fn keys_match(expected: &str, provided: &str) -> bool {
    let expected: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    let provided: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    bool::from(expected.ct_eq(&provided))
}

/// Extract the token from an `Authorization: Bearer <key>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn matching_keys_pass() {
        assert!(keys_match("sekrit", "sekrit"));
    }

    #[test]
    fn wrong_or_truncated_keys_fail() {
        assert!(!keys_match("sekrit", "sekri"));
        assert!(!keys_match("sekrit", ""));
        assert!(!keys_match("sekrit", "sekrit-but-longer"));
    }

    #[test]
    fn bearer_header_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc123"),
        );
        assert_eq!(bearer_token(&headers), Some("abc123"));
    }

    #[test]
    fn non_bearer_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic abc123"),
        );
        assert_eq!(bearer_token(&headers), None);
    }
}
