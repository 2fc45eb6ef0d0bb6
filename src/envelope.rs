//! # Encrypted Envelopes
//!
//! The envelope is the unit of encryption the overlay relays without being
//! able to read. An envelope carries a topic in the clear plus an opaque
//! ciphertext; everything else (payload, padding, sender attribution) lives
//! inside the ciphertext.
//!
//! ## Encryption Modes
//!
//! - **Symmetric**: ChaCha20-Poly1305 under a pre-shared 32-byte key.
//! - **Asymmetric**: ephemeral x25519 key exchange with the recipient's
//!   envelope key, the shared secret run through a domain-separated blake3
//!   KDF, then ChaCha20-Poly1305.
//!
//! The mode marker is the `ephemeral` field: empty means symmetric, 32 bytes
//! means asymmetric, anything else is a malformed envelope and a protocol
//! violation by the sender.
//!
//! ## Proof of Work
//!
//! Each envelope carries a nonce chosen so that
//! `blake3(domain ‖ topic ‖ nonce ‖ ephemeral ‖ ciphertext ‖ pow_nonce)` has
//! a minimum number of leading zero bits. The default target is negligible;
//! it exists so relays can demand work from senders without a format change.

use std::time::{Duration, Instant};

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::address::Topic;
use crate::identity::{EnvelopeKey, Identity, Keypair, ENVELOPE_SIGNATURE_DOMAIN};
use crate::messages::{deserialize_bounded, MAX_PAYLOAD_SIZE};

/// Domain prefix for the proof-of-work hash.
const POW_HASH_DOMAIN: &[u8] = b"sotto-envelope-pow-v1:";

/// KDF context for the x25519 shared secret.
const SHARED_SECRET_CONTEXT: &str = "sotto envelope shared secret v1";

/// Default proof-of-work target in leading zero bits. Deliberately negligible.
pub const DEFAULT_POW_TARGET: u32 = 1;

/// Default budget for the proof-of-work search.
pub const DEFAULT_WORK_LIMIT: Duration = Duration::from_secs(3);

/// Error type for envelope construction and opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The encryption-mode marker is neither empty nor a 32-byte key.
    MalformedMarker { len: usize },
    /// Decryption failed; expected whenever a relay tries a key that is not
    /// the recipient's.
    Decrypt,
    /// The ciphertext opened but the body inside is not well-formed.
    Corrupt,
    /// Payload exceeds the maximum envelope size.
    PayloadTooLarge { size: usize, max: usize },
    /// The work budget expired before the proof-of-work target was met.
    InsufficientWork { achieved: u32, target: u32 },
    /// AEAD encryption failed.
    Encrypt,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::MalformedMarker { len } => {
                write!(f, "malformed encryption-mode marker ({len} bytes)")
            }
            EnvelopeError::Decrypt => write!(f, "could not decrypt envelope"),
            EnvelopeError::Corrupt => write!(f, "envelope body is corrupt"),
            EnvelopeError::PayloadTooLarge { size, max } => {
                write!(f, "payload of {size} bytes exceeds maximum of {max}")
            }
            EnvelopeError::InsufficientWork { achieved, target } => {
                write!(f, "proof of work reached {achieved} of {target} bits")
            }
            EnvelopeError::Encrypt => write!(f, "envelope encryption failed"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Encryption mode of an envelope, read off the mode marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Symmetric,
    Asymmetric,
}

/// Key material for sealing an envelope.
pub enum SealKey<'a> {
    /// Pre-shared 32-byte symmetric key.
    Symmetric(&'a [u8; 32]),
    /// Recipient's public envelope key.
    Asymmetric(&'a EnvelopeKey),
}

/// Parameters for sealing an envelope.
pub struct EnvelopeParams<'a> {
    pub topic: Topic,
    pub payload: &'a [u8],
    /// Random padding folded into the ciphertext to mask payload length.
    pub padding: Vec<u8>,
    /// Minimum leading zero bits of the proof-of-work hash.
    pub pow_target: u32,
    /// Budget for the proof-of-work search.
    pub work_limit: Duration,
    /// When present, the body is signed and carries sender attribution.
    pub sender: Option<&'a Keypair>,
    pub key: SealKey<'a>,
}

/// The plaintext carried inside the ciphertext.
#[derive(Serialize, Deserialize)]
struct SealedBody {
    payload: Vec<u8>,
    padding: Vec<u8>,
    src_envelope_key: Option<[u8; 32]>,
    src_identity: Option<[u8; 32]>,
    signature: Vec<u8>,
}

/// An encrypted envelope as carried on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    nonce: [u8; 12],
    /// Encryption-mode marker: empty for symmetric, the ephemeral x25519
    /// public key for asymmetric.
    ephemeral: Vec<u8>,
    ciphertext: Vec<u8>,
    pow_nonce: u64,
}

impl Envelope {
    /// Encrypt a payload into an envelope.
    pub fn seal(params: EnvelopeParams<'_>) -> Result<Envelope, EnvelopeError> {
        if params.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EnvelopeError::PayloadTooLarge {
                size: params.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let (src_envelope_key, src_identity, signature) = match params.sender {
            Some(keypair) => {
                let mut signed = Vec::with_capacity(32 + params.payload.len());
                signed.extend_from_slice(params.topic.as_bytes());
                signed.extend_from_slice(params.payload);
                (
                    Some(*keypair.envelope_key().as_bytes()),
                    Some(*keypair.identity().as_bytes()),
                    keypair.sign_with_domain(ENVELOPE_SIGNATURE_DOMAIN, &signed),
                )
            }
            None => (None, None, Vec::new()),
        };

        let body = SealedBody {
            payload: params.payload.to_vec(),
            padding: params.padding,
            src_envelope_key,
            src_identity,
            signature,
        };
        let plaintext = bincode::serialize(&body).map_err(|_| EnvelopeError::Encrypt)?;

        let (cipher_key, ephemeral) = match params.key {
            SealKey::Symmetric(key) => (*key, Vec::new()),
            SealKey::Asymmetric(to) => {
                let eph_secret = StaticSecret::random_from_rng(OsRng);
                let eph_public = X25519PublicKey::from(&eph_secret);
                let shared = eph_secret.diffie_hellman(&X25519PublicKey::from(*to.as_bytes()));
                (
                    blake3::derive_key(SHARED_SECRET_CONTEXT, shared.as_bytes()),
                    eph_public.to_bytes().to_vec(),
                )
            }
        };

        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(&cipher_key.into());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| EnvelopeError::Encrypt)?;

        let mut envelope = Envelope {
            topic: params.topic,
            nonce,
            ephemeral,
            ciphertext,
            pow_nonce: 0,
        };
        envelope.stamp_work(params.pow_target, params.work_limit)?;
        Ok(envelope)
    }

    /// The encryption mode of this envelope, or an error for a marker that
    /// is neither of the two valid shapes.
    pub fn kind(&self) -> Result<EnvelopeKind, EnvelopeError> {
        match self.ephemeral.len() {
            0 => Ok(EnvelopeKind::Symmetric),
            32 => Ok(EnvelopeKind::Asymmetric),
            len => Err(EnvelopeError::MalformedMarker { len }),
        }
    }

    /// Attempt to open a symmetrically encrypted envelope with a candidate
    /// key. Failure is the expected outcome for every key but the right one.
    pub fn open_symmetric(&self, key: &[u8; 32]) -> Result<SealedMessage, EnvelopeError> {
        if self.kind()? != EnvelopeKind::Symmetric {
            return Err(EnvelopeError::Decrypt);
        }
        self.open_with(key)
    }

    /// Attempt to open an asymmetrically encrypted envelope with the node's
    /// own keypair.
    pub fn open_asymmetric(&self, keypair: &Keypair) -> Result<SealedMessage, EnvelopeError> {
        if self.kind()? != EnvelopeKind::Asymmetric {
            return Err(EnvelopeError::Decrypt);
        }
        let eph_bytes: [u8; 32] = self.ephemeral.as_slice().try_into().expect("kind checked");
        let shared = keypair
            .envelope_secret()
            .diffie_hellman(&X25519PublicKey::from(eph_bytes));
        self.open_with(&blake3::derive_key(SHARED_SECRET_CONTEXT, shared.as_bytes()))
    }

    fn open_with(&self, cipher_key: &[u8; 32]) -> Result<SealedMessage, EnvelopeError> {
        let cipher = ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(cipher_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| EnvelopeError::Decrypt)?;
        let body: SealedBody =
            deserialize_bounded(&plaintext).map_err(|_| EnvelopeError::Corrupt)?;
        Ok(SealedMessage {
            topic: self.topic,
            payload: body.payload,
            src_envelope_key: body.src_envelope_key.map(EnvelopeKey::from_bytes),
            src_identity: body.src_identity.map(Identity::from_bytes),
            signature: body.signature,
        })
    }

    /// Achieved proof-of-work, in leading zero bits of the work hash.
    pub fn work(&self) -> u32 {
        leading_zero_bits(self.work_hash(self.pow_nonce).as_bytes())
    }

    fn stamp_work(&mut self, target: u32, limit: Duration) -> Result<(), EnvelopeError> {
        let deadline = Instant::now() + limit;
        let mut best = 0u32;
        let mut nonce = 0u64;
        loop {
            let achieved = leading_zero_bits(self.work_hash(nonce).as_bytes());
            if achieved >= target {
                self.pow_nonce = nonce;
                return Ok(());
            }
            best = best.max(achieved);
            // check the clock in batches, hashing is the hot path
            if nonce % 1024 == 0 && Instant::now() >= deadline {
                return Err(EnvelopeError::InsufficientWork {
                    achieved: best,
                    target,
                });
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    fn work_hash(&self, pow_nonce: u64) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(POW_HASH_DOMAIN);
        hasher.update(self.topic.as_bytes());
        hasher.update(&self.nonce);
        hasher.update(&self.ephemeral);
        hasher.update(&self.ciphertext);
        hasher.update(&pow_nonce.to_le_bytes());
        hasher.finalize()
    }

    #[cfg(test)]
    pub fn raw_for_tests(topic: Topic, ciphertext: Vec<u8>) -> Envelope {
        Envelope {
            topic,
            nonce: [0u8; 12],
            ephemeral: Vec::new(),
            ciphertext,
            pow_nonce: 0,
        }
    }

    #[cfg(test)]
    pub fn corrupt_marker_for_tests(mut self) -> Envelope {
        self.ephemeral = vec![0u8; 7];
        self
    }
}

/// A decrypted and unpacked envelope.
#[derive(Debug)]
pub struct SealedMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
    /// Sender's envelope key, present for attributed (signed) messages.
    pub src_envelope_key: Option<EnvelopeKey>,
    /// Sender's identity, present for attributed (signed) messages.
    pub src_identity: Option<Identity>,
    signature: Vec<u8>,
}

impl SealedMessage {
    /// Integrity validation: unsigned messages pass, signed messages must
    /// carry a verifiable sender signature over topic and payload.
    pub fn validate(&self) -> bool {
        if self.signature.is_empty() {
            return self.src_identity.is_none();
        }
        let Some(identity) = self.src_identity else {
            return false;
        };
        let mut signed = Vec::with_capacity(32 + self.payload.len());
        signed.extend_from_slice(self.topic.as_bytes());
        signed.extend_from_slice(&self.payload);
        identity
            .verify_with_domain(ENVELOPE_SIGNATURE_DOMAIN, &signed, &self.signature)
            .is_ok()
    }
}

fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0u32;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
