//! # Identities and Key Material
//!
//! This module defines the cryptographic identity types used throughout the
//! overlay:
//!
//! - [`Keypair`]: Ed25519 signing keypair plus the x25519 envelope secret
//!   derived from the same seed
//! - [`Identity`]: 32-byte Ed25519 public key serving as a peer's stable
//!   identifier (usable as a map key)
//! - [`EnvelopeKey`]: 32-byte x25519 public key messages are encrypted to
//!
//! ## Identity Model
//!
//! Identity = Ed25519 public key. Possession of the private key proves the
//! identity; no external registry is consulted. The envelope secret is
//! derived from the signing seed with a domain-separated KDF, so a node
//! publishes one identity and one envelope key that always travel together.
//!
//! ## Domain Separation
//!
//! Every signature in the crate carries a domain prefix so a signature
//! produced in one context cannot be replayed in another.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Domain separation prefix for envelope payload signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"sotto-envelope-v1:";

/// KDF context string for deriving the envelope secret from the signing seed.
const ENVELOPE_KEY_CONTEXT: &str = "sotto envelope key v1";

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// A peer's stable identifier: the 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether the bytes decode to a valid Ed25519 point.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// Verify a domain-separated signature made by this identity.
    pub fn verify_with_domain(
        &self,
        domain: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        key.verify(&prefixed, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The 32-byte x25519 public key an envelope is encrypted to.
///
/// Its hex form doubles as the key identifier in the messaging layer's
/// public-key registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeKey([u8; 32]);

impl EnvelopeKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from its hex identifier form.
    pub fn from_hex(id: &str) -> Option<Self> {
        let bytes = hex::decode(id).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex identifier used as the registry key for this public key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey({})", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signing keypair plus the derived x25519 envelope secret.
pub struct Keypair {
    signing: SigningKey,
    envelope_secret: StaticSecret,
}

impl Keypair {
    /// Generate a fresh keypair from system randomness.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing)
    }

    /// Reconstruct a keypair from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let derived = blake3::derive_key(ENVELOPE_KEY_CONTEXT, &signing.to_bytes());
        Self {
            signing,
            envelope_secret: StaticSecret::from(derived),
        }
    }

    /// The public identity of this keypair.
    pub fn identity(&self) -> Identity {
        Identity(self.signing.verifying_key().to_bytes())
    }

    /// The public envelope key messages to this node are encrypted to.
    pub fn envelope_key(&self) -> EnvelopeKey {
        EnvelopeKey(X25519PublicKey::from(&self.envelope_secret).to_bytes())
    }

    pub(crate) fn envelope_secret(&self) -> &StaticSecret {
        &self.envelope_secret
    }

    /// Sign data with domain separation.
    ///
    /// Prepends the domain prefix before signing so the signature cannot be
    /// replayed in a different protocol context.
    pub fn sign_with_domain(&self, domain: &[u8], data: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        self.signing.sign(&prefixed).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.identity())
    }
}
