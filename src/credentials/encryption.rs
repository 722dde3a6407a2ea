//! AES-256-GCM envelope encryption for credential token pairs.
//!
//! The symmetric key is the SHA-256 digest of the process-wide master secret.
//! It is derived once when the [`SecretStore`] is built and is never written
//! anywhere. Every seal draws a fresh random nonce.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use super::TokenPair;
use crate::error::{BrokerError, Result};

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// At-rest form of a token pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub auth_tag: [u8; TAG_SIZE],
}

impl EncryptedEnvelope {
    /// Base64-encodes (ciphertext, nonce, auth_tag) for text columns.
    pub fn to_base64(&self) -> (String, String, String) {
        (
            BASE64.encode(&self.ciphertext),
            BASE64.encode(self.nonce),
            BASE64.encode(self.auth_tag),
        )
    }

    /// Rebuilds an envelope from its base64 columns.
    ///
    /// Malformed encodings or wrong sizes are integrity failures: the record
    /// cannot be trusted either way.
    pub fn from_base64(ciphertext: &str, nonce: &str, auth_tag: &str) -> Result<Self> {
        let ciphertext = BASE64.decode(ciphertext).map_err(|_| BrokerError::Integrity)?;
        let nonce: [u8; NONCE_SIZE] = BASE64
            .decode(nonce)
            .map_err(|_| BrokerError::Integrity)?
            .try_into()
            .map_err(|_| BrokerError::Integrity)?;
        let auth_tag: [u8; TAG_SIZE] = BASE64
            .decode(auth_tag)
            .map_err(|_| BrokerError::Integrity)?
            .try_into()
            .map_err(|_| BrokerError::Integrity)?;

        Ok(Self {
            ciphertext,
            nonce,
            auth_tag,
        })
    }
}

/// Seals and unseals token pairs under the key derived from the master secret.
///
/// Stateless apart from the cipher; cheap to share behind an `Arc`.
#[derive(Clone)]
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Derives the vault key from `master_secret`.
    ///
    /// Fails with a configuration error when the secret is blank.
    pub fn new(master_secret: &str) -> Result<Self> {
        if master_secret.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "master secret is missing or empty".to_string(),
            ));
        }

        let key = Sha256::digest(master_secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| BrokerError::Configuration(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// Encrypts `tokens`, binding the result to `associated_data`.
    ///
    /// The same associated data must be supplied to [`SecretStore::unseal`].
    pub fn seal(&self, tokens: &TokenPair, associated_data: &[u8]) -> Result<EncryptedEnvelope> {
        let plaintext = serde_json::to_vec(tokens)
            .map_err(|e| BrokerError::InvalidResponse(format!("Failed to encode tokens: {}", e)))?;

        // Never reuse a nonce under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| BrokerError::Integrity)?;

        // aes-gcm appends the tag to the ciphertext
        let tag_start = sealed.len() - TAG_SIZE;
        let tag = sealed.split_off(tag_start);

        let mut envelope = EncryptedEnvelope {
            ciphertext: sealed,
            nonce: [0u8; NONCE_SIZE],
            auth_tag: [0u8; TAG_SIZE],
        };
        envelope.nonce.copy_from_slice(nonce.as_slice());
        envelope.auth_tag.copy_from_slice(&tag);

        Ok(envelope)
    }

    /// Decrypts an envelope. Any authentication failure yields
    /// [`BrokerError::Integrity`]; no partial plaintext is ever returned.
    pub fn unseal(&self, envelope: &EncryptedEnvelope, associated_data: &[u8]) -> Result<TokenPair> {
        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: &sealed,
                    aad: associated_data,
                },
            )
            .map_err(|_| BrokerError::Integrity)?;

        serde_json::from_slice(&plaintext).map_err(|_| BrokerError::Integrity)
    }
}
