//! Signed message envelope.
//!
//! Every non-heartbeat frame on the wire is one of these. The signature is
//! Ed25519 over the UTF-8 bytes of `content`, verified against the key the
//! envelope itself carries — trust is transitive via topic membership, not a
//! certificate chain.

use ed25519_dalek::{pkcs8::DecodePublicKey, Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// One signed frame carrying an inner JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedEnvelope {
    /// Inner payload, serialised exactly once by the signer.
    pub content: String,
    /// Full SPKI hex public key of the sender.
    #[serde(rename = "senderKey")]
    pub sender_key: String,
    /// Hex-encoded Ed25519 signature over the UTF-8 bytes of `content`.
    pub signature: String,
    /// Millisecond wall-clock at signing.
    pub timestamp: i64,
}

impl SignedEnvelope {
    /// Check the signature against the embedded sender key.
    ///
    /// Verifies the exact `content` bytes — never a re-serialisation.
    pub fn verify(&self) -> bool {
        let Ok(key_der) = hex::decode(&self.sender_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_public_key_der(&key_der) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.signature) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        key.verify(self.content.as_bytes(), &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::identity::NodeIdentity;

    fn identity() -> NodeIdentity {
        let dir = tempfile::tempdir().unwrap();
        NodeIdentity::load_or_create(dir.path()).unwrap()
    }

    #[test]
    fn sign_verify_round_trip() {
        let id = identity();
        let env = id.sign(r#"{"type":"handshake"}"#.to_string());
        assert!(env.verify());
        assert_eq!(env.sender_key, id.public_key_hex());
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let id = identity();
        let mut env = id.sign(r#"{"type":"CHAT","text":"hi"}"#.to_string());
        let mut bytes = hex::decode(&env.signature).unwrap();
        bytes[0] ^= 0x01;
        env.signature = hex::encode(bytes);
        assert!(!env.verify());
    }

    #[test]
    fn altered_content_is_rejected() {
        let id = identity();
        let mut env = id.sign(r#"{"type":"CHAT","text":"hi"}"#.to_string());
        env.content = r#"{"type":"CHAT","text":"bye"}"#.to_string();
        assert!(!env.verify());
    }

    #[test]
    fn content_survives_json_round_trip_verbatim() {
        // Whitespace quirks in the signed string must be preserved by
        // envelope (de)serialisation or verification would break.
        let id = identity();
        let env = id.sign("{\"type\":\"CHAT\",  \"text\": \"spaced\"}".to_string());
        let wire = serde_json::to_string(&env).unwrap();
        let back: super::SignedEnvelope = serde_json::from_str(&wire).unwrap();
        assert!(back.verify());
        assert_eq!(back.content, env.content);
    }

    #[test]
    fn garbage_key_or_signature_is_rejected() {
        let env = super::SignedEnvelope {
            content: "{}".into(),
            sender_key: "zz-not-hex".into(),
            signature: "00".into(),
            timestamp: 0,
        };
        assert!(!env.verify());
    }
}
