//! Cryptographic primitives for the link layer
//!
//! This module provides clean, safe wrappers around the cryptographic
//! operations the handshake needs: Noise static keys, Ed25519 identity
//! signatures, trust-root endorsements and handshake transcript binding.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use snow::Builder;

use crate::errors::CryptographicError;
use crate::membership::{GroupPolicy, MemberInfo, PkiMode};
use crate::types::SessionId;
use crate::{LinkError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Noise Protocol configuration for session handshakes
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Domain separator mixed into every handshake signature
const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"p2p-link/handshake/v1";

// ----------------------------------------------------------------------------
// Signature Spec
// ----------------------------------------------------------------------------

/// Signature scheme requested from the signing oracle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureSpec {
    Ed25519,
}

/// Which side of the handshake produced a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

impl HandshakeRole {
    fn tag(self) -> u8 {
        match self {
            HandshakeRole::Initiator => 0x01,
            HandshakeRole::Responder => 0x02,
        }
    }
}

// ----------------------------------------------------------------------------
// Identity Key Pair (Ed25519)
// ----------------------------------------------------------------------------

/// Ed25519 signing key pair for an identity's session key
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self::generate_with_rng(&mut rng)
    }

    /// Generate a new identity key pair with custom RNG
    pub fn generate_with_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut secret_bytes = [0u8; 32];
        rng.fill_bytes(&mut secret_bytes);
        Self::from_bytes(&secret_bytes)
    }

    /// Create from raw private key bytes
    pub fn from_bytes(private_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(private_key);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign data with flexible input types
    pub fn sign<T: AsRef<[u8]>>(&self, data: T) -> [u8; 64] {
        self.signing_key.sign(data.as_ref()).to_bytes()
    }

    /// Endorse another member's session key as a trust root
    pub fn endorse(&self, session_public_key: &[u8; 32]) -> Vec<u8> {
        self.sign(session_public_key).to_vec()
    }
}

/// Verify an Ed25519 signature made by `public_key`
pub fn verify_signature<D: AsRef<[u8]>>(
    public_key: &[u8; 32],
    data: D,
    signature: &[u8],
) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| LinkError::Crypto(CryptographicError::InvalidKeyFormat))?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| LinkError::signature_error())?;
    let signature = Signature::from_bytes(&signature);

    verifying_key
        .verify(data.as_ref(), &signature)
        .map_err(|_| LinkError::signature_error())
}

// ----------------------------------------------------------------------------
// Trust Roots
// ----------------------------------------------------------------------------

/// Check that a member's session key is anchored per the group's PKI mode
pub fn check_session_key_trust(policy: &GroupPolicy, member: &MemberInfo) -> Result<()> {
    match policy.pki_mode {
        PkiMode::NoPki => Ok(()),
        PkiMode::Standard => {
            if policy.trust_roots.is_empty() {
                return Err(CryptographicError::MissingTrustRoots {
                    group_id: policy.group_id.clone(),
                }
                .into());
            }

            let endorsement = member.session_key_endorsement.as_deref().ok_or_else(|| {
                CryptographicError::UntrustedSessionKey {
                    group_id: policy.group_id.clone(),
                }
            })?;

            let endorsed = policy.trust_roots.iter().any(|root| {
                verify_signature(root, member.session_public_key, endorsement).is_ok()
            });

            if endorsed {
                Ok(())
            } else {
                Err(CryptographicError::UntrustedSessionKey {
                    group_id: policy.group_id.clone(),
                }
                .into())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Handshake Transcript Binding
// ----------------------------------------------------------------------------

/// Bytes an identity signs to bind itself to one completed Noise handshake
pub fn handshake_signing_payload(
    role: HandshakeRole,
    session_id: &SessionId,
    handshake_hash: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(
        HANDSHAKE_SIGNATURE_DOMAIN.len() + 1 + session_id.len() + handshake_hash.len(),
    );
    payload.extend_from_slice(HANDSHAKE_SIGNATURE_DOMAIN);
    payload.push(role.tag());
    payload.extend_from_slice(session_id.as_bytes());
    payload.extend_from_slice(handshake_hash);
    payload
}

// ----------------------------------------------------------------------------
// Noise Key Pair (X25519)
// ----------------------------------------------------------------------------

/// X25519 static key pair for one Noise handshake
///
/// Identity is proven by Ed25519 signatures, so a fresh static key is used
/// per session.
pub struct NoiseKeyPair {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl core::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

impl NoiseKeyPair {
    /// Generate a new random Noise key pair
    pub fn generate() -> Result<Self> {
        let keypair = Builder::new(NOISE_PATTERN.parse()?).generate_keypair()?;
        Ok(Self {
            private_key: keypair.private,
            public_key: keypair.public,
        })
    }

    pub fn private_key_bytes(&self) -> &[u8] {
        &self.private_key
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
