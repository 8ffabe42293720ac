//! Node identity: a long-lived Ed25519 keypair persisted in the data directory.
//!
//! # Key format
//! Keys are stored as hex strings of their DER encodings (SPKI for the public
//! key, PKCS#8 for the private key) in a single JSON file. The full SPKI hex
//! string is the node identifier carried in every envelope; the raw form is
//! the last 64 hex characters of it (the fixed SPKI prefix stripped), and a
//! short identifier is the last 8 hex characters of the raw form.
//!
//! A file that cannot be decoded is a startup error, never a silent identity
//! rotation: rotating the key changes the node id every peer knows us by.

use std::{fs, path::Path};

use ed25519_dalek::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    Signer, SigningKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::{envelope::SignedEnvelope, error::P2pError};

/// File name of the persisted keypair inside the data directory.
pub const IDENTITY_FILE: &str = "identity.json";

/// Hex length of the raw (post-prefix) public key: 32 bytes.
const RAW_KEY_HEX_LEN: usize = 64;

/// Hex length of a short peer identifier.
pub const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
}

/// The node's Ed25519 keypair plus its derived identifiers.
pub struct NodeIdentity {
    signing: SigningKey,
    public_hex: String,
}

impl NodeIdentity {
    /// Load the keypair from `data_dir`, generating and persisting a fresh
    /// one on first boot.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, P2pError> {
        let path = data_dir.join(IDENTITY_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path).map_err(|e| P2pError::Identity(e.to_string()))?;
            let file: IdentityFile =
                serde_json::from_str(&text).map_err(|e| P2pError::Identity(e.to_string()))?;

            let der = hex::decode(&file.private_key)
                .map_err(|e| P2pError::Identity(format!("bad private key hex: {e}")))?;
            let signing = SigningKey::from_pkcs8_der(&der).map_err(|e| {
                P2pError::Identity(format!(
                    "identity file '{}' could not be decoded ({e}); refusing to rotate the \
                     node identity — delete the file to generate a new one",
                    path.display()
                ))
            })?;

            let derived = public_key_hex(&signing)?;
            if !derived.eq_ignore_ascii_case(&file.public_key) {
                return Err(P2pError::Identity(format!(
                    "identity file '{}' is inconsistent: stored public key does not match \
                     the private key",
                    path.display()
                )));
            }

            return Ok(Self {
                signing,
                public_hex: file.public_key,
            });
        }

        let signing = SigningKey::generate(&mut OsRng);
        let public_hex = public_key_hex(&signing)?;
        let private_hex = hex::encode(
            signing
                .to_pkcs8_der()
                .map_err(|e| P2pError::Identity(e.to_string()))?
                .as_bytes(),
        );

        fs::create_dir_all(data_dir).map_err(|e| P2pError::Identity(e.to_string()))?;
        let file = IdentityFile {
            public_key: public_hex.clone(),
            private_key: private_hex,
        };
        let text =
            serde_json::to_string_pretty(&file).map_err(|e| P2pError::Identity(e.to_string()))?;
        fs::write(&path, text).map_err(|e| P2pError::Identity(e.to_string()))?;
        tracing::info!("generated new identity at {}", path.display());

        Ok(Self {
            signing,
            public_hex,
        })
    }

    /// Full SPKI hex public key — the node identifier used in envelopes.
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Last 8 hex characters of the raw public key.
    pub fn short_id(&self) -> String {
        short_id_of(&self.public_hex)
    }

    /// Sign an inner-payload string, producing the wire envelope.
    ///
    /// The caller serialises the payload to JSON exactly once; the same
    /// string is embedded verbatim so verifiers check the identical bytes.
    pub fn sign(&self, content: String) -> SignedEnvelope {
        let signature = self.signing.sign(content.as_bytes());
        SignedEnvelope {
            sender_key: self.public_hex.clone(),
            signature: hex::encode(signature.to_bytes()),
            timestamp: chrono::Utc::now().timestamp_millis(),
            content,
        }
    }
}

fn public_key_hex(signing: &SigningKey) -> Result<String, P2pError> {
    let der = signing
        .verifying_key()
        .to_public_key_der()
        .map_err(|e| P2pError::Identity(e.to_string()))?;
    Ok(hex::encode(der.as_bytes()))
}

/// The raw key form: everything after the fixed SPKI prefix.
pub fn raw_key_hex(public_hex: &str) -> &str {
    if public_hex.len() >= RAW_KEY_HEX_LEN {
        &public_hex[public_hex.len() - RAW_KEY_HEX_LEN..]
    } else {
        public_hex
    }
}

/// Last 8 hex characters of the raw key form.
pub fn short_id_of(public_hex: &str) -> String {
    let raw = raw_key_hex(public_hex);
    if raw.len() >= SHORT_ID_LEN {
        raw[raw.len() - SHORT_ID_LEN..].to_string()
    } else {
        raw.to_string()
    }
}
