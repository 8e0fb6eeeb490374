//! Artifact signature verification.
//!
//! Every downloaded artifact is verified against the publisher's Ed25519 key
//! before a single archive byte is parsed. The feed itself travels over
//! HTTPS but is not otherwise trusted; the signature on the artifact is the
//! root of trust for installed bytes.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

/// Signature verification failures.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The feed item carried no signature and the verifier requires one.
    #[error("Update is not signed")]
    MissingSignature,

    /// Key or signature material failed to decode.
    #[error("Invalid signature encoding: {0}")]
    Encoding(String),

    /// The signature did not verify against the artifact bytes.
    #[error("Signature verification failed")]
    Mismatch,
}

/// Verifies a downloaded artifact against the signature advertised in the
/// feed. Implementations decide what "no signature" means.
pub trait SignatureVerifier: Send + Sync {
    /// Checks `signature` (as carried in the feed item, if any) over `data`.
    fn verify(&self, data: &[u8], signature: Option<&str>) -> Result<(), SignatureError>;
}

impl std::fmt::Debug for dyn SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SignatureVerifier")
    }
}

/// Ed25519 verifier holding the publisher's public key. Unsigned items are
/// rejected.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Builds a verifier from a base64-encoded 32-byte public key.
    pub fn from_base64(encoded: &str) -> Result<Self, SignatureError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SignatureError::Encoding(format!("public key: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::Encoding("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::Encoding(format!("public key: {e}")))?;
        Ok(Self { key })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, data: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
        let encoded = signature.ok_or(SignatureError::MissingSignature)?;
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SignatureError::Encoding(format!("signature: {e}")))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| SignatureError::Encoding("signature must be 64 bytes".into()))?;
        let signature = Signature::from_bytes(&bytes);
        self.key
            .verify_strict(data, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

/// Accepts everything, signed or not. Only for deployments that explicitly
/// opt out of artifact signing; never the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _data: &[u8], _signature: Option<&str>) -> Result<(), SignatureError> {
        Ok(())
    }
}
