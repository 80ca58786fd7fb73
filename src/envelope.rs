// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Confidentiality/integrity envelope for inter-node messages.
//!
//! Every outbound peer payload is sealed into a self-describing ciphertext
//! blob; every inbound payload is verified and opened before dispatch.
//! Nodes holding different master keys silently fail to converge, which is
//! the mesh's isolation boundary.
//!
//! # Construction
//!
//! - AES-256-GCM (96-bit nonce, 128-bit tag), keyed per message.
//! - Per-message key = PBKDF2-SHA256(master key, fresh 128-bit salt,
//!   `kdf_iterations` rounds).
//! - HMAC-SHA256 over canonical JSON for the handshake MAC, verified in
//!   constant time.
//!
//! # Wire format
//!
//! ```text
//! { "encrypted": true,
//!   "algorithm": "aes-256-gcm",
//!   "salt": base64, "iv": base64, "authTag": base64, "ciphertext": base64,
//!   "isBuffer": bool? }
//! ```
//!
//! or `{ "encrypted": false, "data": <payload> }` when the envelope is
//! disabled.

use crate::config::SecurityConfig;
use crate::error::{ReplicationError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload as AeadPayload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// A payload as seen by the envelope: structured JSON, UTF-8 text, or a raw
/// byte buffer (flagged `isBuffer` on the wire).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    fn plaintext(&self) -> Result<(Vec<u8>, bool)> {
        match self {
            Payload::Json(value) => Ok((serde_json::to_vec(value)?, false)),
            Payload::Text(text) => Ok((text.clone().into_bytes(), false)),
            Payload::Bytes(bytes) => Ok((bytes.clone(), true)),
        }
    }

    fn from_plaintext(bytes: Vec<u8>, is_buffer: bool) -> Payload {
        if is_buffer {
            return Payload::Bytes(bytes);
        }
        // Structured payloads parse back to JSON; anything else is text.
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

/// Serialized envelope, the unit that crosses the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeBlob {
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_buffer: Option<bool>,
    /// Present only on unencrypted envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EnvelopeBlob {
    /// Unencrypted passthrough envelope.
    pub fn plain(data: Value) -> Self {
        Self {
            encrypted: false,
            algorithm: None,
            salt: None,
            iv: None,
            auth_tag: None,
            ciphertext: None,
            is_buffer: None,
            data: Some(data),
        }
    }
}

/// Symmetric authenticated encryption of message payloads.
///
/// One instance per node, constructed from [`SecurityConfig`]. Cheap to
/// share behind an `Arc`; key derivation happens per message.
pub struct SecurityEnvelope {
    master_key: Vec<u8>,
    algorithm: String,
    kdf_iterations: u32,
}

impl SecurityEnvelope {
    /// Build an envelope from validated security config.
    ///
    /// Callers should have run `NodeConfig::validate()` first; this
    /// re-checks the essentials so a bare `SecurityConfig` can't produce a
    /// weak envelope.
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let master_key = config
            .master_key
            .as_ref()
            .ok_or_else(|| ReplicationError::Config("security.master_key is required".into()))?;
        if master_key.len() < 16 {
            return Err(ReplicationError::Config(
                "security.master_key must be at least 16 characters".into(),
            ));
        }
        if config.kdf_iterations < 1000 {
            return Err(ReplicationError::Config(
                "security.kdf_iterations must be >= 1000".into(),
            ));
        }
        Ok(Self {
            master_key: master_key.as_bytes().to_vec(),
            algorithm: config.algorithm.clone(),
            kdf_iterations: config.kdf_iterations,
        })
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.master_key, salt, self.kdf_iterations, &mut key);
        key
    }

    /// Seal a payload into a ciphertext envelope.
    pub fn encrypt(&self, payload: &Payload) -> Result<EnvelopeBlob> {
        let (plaintext, is_buffer) = payload.plaintext()?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ReplicationError::Internal(format!("cipher init: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, AeadPayload::from(plaintext.as_slice()))
            .map_err(|e| ReplicationError::Internal(format!("encrypt: {}", e)))?;

        // The aead crate appends the 128-bit tag; split it into its own
        // field so the envelope is self-describing.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EnvelopeBlob {
            encrypted: true,
            algorithm: Some(self.algorithm.clone()),
            salt: Some(BASE64.encode(salt)),
            iv: Some(BASE64.encode(nonce_bytes)),
            auth_tag: Some(BASE64.encode(tag)),
            ciphertext: Some(BASE64.encode(sealed)),
            is_buffer: if is_buffer { Some(true) } else { None },
            data: None,
        })
    }

    /// Open a ciphertext envelope.
    ///
    /// Unencrypted envelopes pass their `data` through unchanged. Any
    /// verification failure (wrong key, tampered field, missing field) is a
    /// [`ReplicationError::Decrypt`].
    pub fn decrypt(&self, blob: &EnvelopeBlob) -> Result<Payload> {
        if !blob.encrypted {
            return Ok(Payload::Json(blob.data.clone().unwrap_or(Value::Null)));
        }

        let salt = decode_field(&blob.salt, "salt")?;
        let nonce_bytes = decode_field(&blob.iv, "iv")?;
        let tag = decode_field(&blob.auth_tag, "authTag")?;
        let mut ciphertext = decode_field(&blob.ciphertext, "ciphertext")?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(ReplicationError::Decrypt("bad iv length".into()));
        }
        if tag.len() != TAG_LEN {
            return Err(ReplicationError::Decrypt("bad authTag length".into()));
        }

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ReplicationError::Internal(format!("cipher init: {}", e)))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        ciphertext.extend_from_slice(&tag);
        let plaintext = cipher
            .decrypt(nonce, AeadPayload::from(ciphertext.as_slice()))
            .map_err(|_| ReplicationError::Decrypt("verification failed".into()))?;

        Ok(Payload::from_plaintext(
            plaintext,
            blob.is_buffer.unwrap_or(false),
        ))
    }

    /// HMAC-SHA256 tag over the canonical JSON form of `data`, hex-encoded.
    pub fn mac(&self, data: &Value) -> Result<String> {
        let canonical = serde_json::to_vec(data)?;
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.master_key)
            .map_err(|e| ReplicationError::Internal(format!("hmac init: {}", e)))?;
        mac.update(&canonical);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a MAC tag in constant time.
    pub fn verify_mac(&self, data: &Value, tag: &str) -> bool {
        let expected = match self.mac(data) {
            Ok(t) => t,
            Err(_) => return false,
        };
        let (a, b) = match (hex::decode(expected), hex::decode(tag)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => return false,
        };
        if a.len() != b.len() {
            return false;
        }
        a.ct_eq(&b).into()
    }
}

fn decode_field(field: &Option<String>, name: &str) -> Result<Vec<u8>> {
    let encoded = field
        .as_ref()
        .ok_or_else(|| ReplicationError::Decrypt(format!("missing {}", name)))?;
    BASE64
        .decode(encoded)
        .map_err(|_| ReplicationError::Decrypt(format!("bad base64 in {}", name)))
}

/// 128 random bits, hex-encoded. Used for message and sync IDs.
pub fn generate_secure_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
