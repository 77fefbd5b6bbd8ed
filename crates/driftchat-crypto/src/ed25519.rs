//! Ed25519 signing and verification.
//!
//! Wraps `ed25519-dalek` behind fixed-size byte types matching the wire
//! layout: 32-byte seeds and public keys, 64-byte signatures. Replica
//! traffic is signed so a peer cannot forge messages from another
//! replica; verification uses RFC 8032 strict mode to reject malleable
//! signatures.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};

/// A 64-byte Ed25519 signature as it appears on the wire.
pub type Signature = [u8; 64];

/// An Ed25519 secret (signing) key.
pub struct SecretKey {
    inner: SigningKey,
}

// Never print key material.
impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("inner", &"<redacted>")
            .finish()
    }
}

impl SecretKey {
    /// Creates a signing key from a 32-byte seed.
    ///
    /// # Panics
    ///
    /// Panics if the seed is all zeros (degenerate key); key material is
    /// supplied by configuration and an all-zero seed is a config bug.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        assert_ne!(seed, &[0u8; 32], "ed25519 seed is all zeros");
        Self {
            inner: SigningKey::from_bytes(seed),
        }
    }

    /// Derives the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Signs a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.inner.sign(message).to_bytes()
    }
}

/// An Ed25519 public (verifying) key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Creates a verifying key from its 32-byte compressed form.
    ///
    /// Returns `None` if the bytes are not a valid curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        VerifyingKey::from_bytes(bytes)
            .ok()
            .map(|inner| Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Verifies a signature over a message. Uses RFC 8032 strict
    /// verification, rejecting non-canonical (malleable) signatures.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.inner.verify_strict(message, &sig).is_ok()
    }
}

/// Derives a keypair from a 32-byte seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> (SecretKey, PublicKey) {
    let secret = SecretKey::from_seed(seed);
    let public = secret.public_key();
    (secret, public)
}

/// Signs `message` with `secret`, returning the 64-byte signature.
pub fn sign(message: &[u8], secret: &SecretKey) -> Signature {
    secret.sign(message)
}

/// Verifies `signature` over `message` against `public`.
pub fn verify(message: &[u8], signature: &Signature, public: &PublicKey) -> bool {
    public.verify(message, signature)
}
