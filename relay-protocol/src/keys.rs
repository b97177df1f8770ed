//! # Key Material
//!
//! RSA key material for the node and its peers, and the HMAC hash used by
//! the gateway handshake. Key objects are immutable after construction and
//! safe to share across tasks; every signing or encryption call builds its
//! own working state.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CodecError;

/// Key size for ephemeral node keys when the config does not supply one.
const GENERATED_KEY_BITS: usize = 2048;

// ─── Node Key Pair ──────────────────────────────────────────────

/// The node's asymmetric identity: signs outgoing Sign-Only envelopes and
/// decrypts incoming Encrypt envelopes. The fingerprint is what clients pin
/// from the `welcome` payload.
#[derive(Debug, Clone)]
pub struct NodeKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    fingerprint: String,
}

impl NodeKeyPair {
    /// Loads a key pair from a PEM-encoded private key. Accepts both PKCS#8
    /// (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`) encodings.
    pub fn from_private_pem(pem: &str) -> Result<Self, CodecError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        Self::from_private(private)
    }

    /// Generates a fresh ephemeral key pair.
    pub fn generate() -> Result<Self, CodecError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, GENERATED_KEY_BITS)
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        Self::from_private(private)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, CodecError> {
        let public = private.to_public_key();
        let fingerprint = fingerprint_of(&public)?;
        Ok(Self {
            private,
            public,
            fingerprint,
        })
    }

    /// base64(SHA-256) of the public key's SPKI DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The public half, PEM-encoded, for the periodic public-key publication.
    pub fn public_key_pem(&self) -> Result<String, CodecError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CodecError::InvalidKey(e.to_string()))
    }

    pub(crate) fn private(&self) -> &RsaPrivateKey {
        &self.private
    }
}

// ─── Peer Public Key ────────────────────────────────────────────

/// A peer's public key, parsed from the PEM an agent presents during `auth`.
/// Once stored on the connection, the node encrypts every envelope to it.
#[derive(Debug, Clone)]
pub struct PeerPublicKey {
    key: RsaPublicKey,
}

impl PeerPublicKey {
    /// Parses a PEM public key. Accepts SPKI (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings.
    pub fn from_pem(pem: &str) -> Result<Self, CodecError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub(crate) fn key(&self) -> &RsaPublicKey {
        &self.key
    }
}

fn fingerprint_of(public: &RsaPublicKey) -> Result<String, CodecError> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
    Ok(BASE64.encode(Sha256::digest(der.as_bytes())))
}

// ─── Gateway Handshake Hash ─────────────────────────────────────

/// Computes the three-part gateway handshake hash: HMAC-SHA256 keyed by the
/// pre-shared key over `nonce1 || "." || nonce2`, base64-encoded. Both ends
/// compute it over the verifier's nonce first and the dialer's nonce second.
pub fn handshake_hash(pre_shared_key: &str, nonce1: &str, nonce2: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(pre_shared_key.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(nonce1.as_bytes());
    mac.update(b".");
    mac.update(nonce2.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips_through_pem() {
        let keys = NodeKeyPair::generate().unwrap();
        let pem = keys.public_key_pem().unwrap();
        let peer = PeerPublicKey::from_pem(&pem).unwrap();
        assert_eq!(peer.key(), &keys.public);
    }

    #[test]
    fn fingerprint_is_stable_for_the_same_key() {
        let keys = NodeKeyPair::generate().unwrap();
        let again = NodeKeyPair::from_private(keys.private.clone()).unwrap();
        assert_eq!(keys.fingerprint(), again.fingerprint());
    }

    #[test]
    fn handshake_hash_depends_on_every_part() {
        let base = handshake_hash("psk", "n1", "n2");
        assert_eq!(base, handshake_hash("psk", "n1", "n2"));
        assert_ne!(base, handshake_hash("other", "n1", "n2"));
        assert_ne!(base, handshake_hash("psk", "nX", "n2"));
        assert_ne!(base, handshake_hash("psk", "n1", "nX"));
    }
}
