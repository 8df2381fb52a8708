//! Ed25519 server signing keys.
//!
//! Each Sigil server signs its attestations with an Ed25519 key pair. Remote
//! servers verify those signatures using the public key from our key document.
//!
//! # Key IDs
//! Key IDs follow the Matrix convention `ed25519:<version>`, where the version
//! is a small integer that increases on every rotation (`ed25519:0`,
//! `ed25519:1`, ...).
//!
//! # Encoding
//! Public keys, seeds, and signatures are unpadded standard base64, as in
//! Matrix. Decoding tolerates trailing padding.

use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::error::FederationError;

pub const ALGORITHM: &str = "ed25519";

// ─── Key pair ────────────────────────────────────────────────────────────────

/// An Ed25519 signing key pair for this server.
pub struct ServerKeyPair {
    /// Key ID in the format `ed25519:<version>`.
    pub key_id: String,
    pub version: i64,
    signing_key: SigningKey,
}

impl ServerKeyPair {
    /// Generate a brand-new random Ed25519 key pair.
    pub fn generate(version: i64) -> Self {
        Self::from_signing_key(version, SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct a `ServerKeyPair` from raw 32-byte seed bytes (as stored in DB).
    pub fn from_seed(version: i64, seed: &[u8]) -> Result<Self, FederationError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| FederationError::KeyLoad("seed must be exactly 32 bytes".into()))?;
        Ok(Self::from_signing_key(version, SigningKey::from_bytes(&bytes)))
    }

    /// Parse a configured signing key.
    ///
    /// Accepts the signedjson text form `ed25519 <version> <base64 seed>` or a
    /// bare base64 seed, which gets version 0.
    pub fn from_config(value: &str) -> Result<Self, FederationError> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        let (version, seed) = match parts.as_slice() {
            [seed] => (0, *seed),
            [alg, version, seed] if *alg == ALGORITHM => {
                let version = version.parse::<i64>().map_err(|_| {
                    FederationError::KeyLoad(format!("invalid key version '{version}'"))
                })?;
                (version, *seed)
            }
            _ => {
                return Err(FederationError::KeyLoad(
                    "expected 'ed25519 <version> <seed>' or a base64 seed".into(),
                ));
            }
        };
        let seed = decode_base64(seed)
            .map_err(|_| FederationError::KeyLoad("seed is not valid base64".into()))?;
        Self::from_seed(version, &seed)
    }

    fn from_signing_key(version: i64, signing_key: SigningKey) -> Self {
        Self { key_id: key_id_for(version), version, signing_key }
    }

    /// Return the 32-byte seed (private key scalar) for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Return the public verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Return the public key as unpadded base64.
    pub fn public_key_base64(&self) -> String {
        encode_base64(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes and return the base64-encoded signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        encode_base64(&self.signing_key.sign(bytes).to_bytes())
    }
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

pub fn key_id_for(version: i64) -> String {
    format!("{ALGORITHM}:{version}")
}

pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

pub fn decode_base64(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(s.trim_end_matches('='))
}

/// Verify an Ed25519 signature.
///
/// * `pubkey_base64`: base64-encoded 32-byte verifying key
/// * `sig_base64`:    base64-encoded 64-byte signature
/// * `message`:       original signed bytes
pub fn verify_signature(
    pubkey_base64: &str,
    sig_base64: &str,
    message: &[u8],
) -> Result<(), FederationError> {
    use ed25519_dalek::Verifier;

    let pubkey_bytes = decode_base64(pubkey_base64).map_err(|_| FederationError::InvalidSignature)?;
    let sig_bytes = decode_base64(sig_base64).map_err(|_| FederationError::InvalidSignature)?;

    let verifying_key = VerifyingKey::from_bytes(
        pubkey_bytes
            .as_slice()
            .try_into()
            .map_err(|_| FederationError::InvalidSignature)?,
    )
    .map_err(|_| FederationError::InvalidSignature)?;

    let signature = ed25519_dalek::Signature::from_bytes(
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| FederationError::InvalidSignature)?,
    );

    verifying_key.verify(message, &signature).map_err(|_| FederationError::InvalidSignature)
}
