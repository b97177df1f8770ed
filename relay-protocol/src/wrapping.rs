//! # Transport Wrappings
//!
//! The three transport formats an envelope travels in:
//!
//! - **PlainText** — the envelope JSON, verbatim.
//! - **SignOnly** — compact JWS (RS256) signed by the sender's private key.
//! - **Encrypt** — compact JWE (RSA-OAEP-256 + A256CBC-HS512) to the
//!   recipient's public key.
//!
//! Decoding is strict: the wire bytes must have the shape the expected
//! wrapping requires, and every cryptographic rejection collapses into one
//! uniform error so the failure mode leaks nothing about the cause.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::Oaep;
use sha2::{Sha256, Sha512};

use crate::envelope::Envelope;
use crate::error::CodecError;
use crate::keys::{NodeKeyPair, PeerPublicKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Protected header on Sign-Only envelopes.
const SIGN_HEADER: &str = r#"{"alg":"RS256","encrypted":"false","version":"1"}"#;

/// Protected header on Encrypt envelopes.
const ENCRYPT_HEADER: &str =
    r#"{"alg":"RSA-OAEP-256","enc":"A256CBC-HS512","encrypted":"true","version":"1"}"#;

/// Content-encryption key length: 32 bytes HMAC-SHA-512 key followed by
/// 32 bytes AES-256 key, per A256CBC-HS512.
const CEK_LEN: usize = 64;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

// ─── Wrapping ───────────────────────────────────────────────────

/// Transport format applied to a serialized envelope. Which wrapping a
/// connection expects is a function of its state; receiving a differently
/// wrapped frame is a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapping {
    PlainText,
    SignOnly,
    Encrypt,
}

impl Wrapping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Wrapping::PlainText => "plaintext",
            Wrapping::SignOnly => "sign-only",
            Wrapping::Encrypt => "encrypt",
        }
    }
}

impl std::fmt::Display for Wrapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Encoding ───────────────────────────────────────────────────

/// Serializes an envelope and applies the wrapping. `keys` signs Sign-Only
/// output; `recipient` is required for Encrypt.
pub fn encode(
    envelope: &Envelope,
    wrapping: Wrapping,
    keys: &NodeKeyPair,
    recipient: Option<&PeerPublicKey>,
) -> Result<String, CodecError> {
    let json = serde_json::to_string(envelope)
        .map_err(|e| CodecError::MalformedPayload(e.to_string()))?;
    match wrapping {
        Wrapping::PlainText => Ok(json),
        Wrapping::SignOnly => Ok(sign(&json, keys)),
        Wrapping::Encrypt => {
            let recipient = recipient.ok_or(CodecError::RecipientKeyRequired)?;
            encrypt(&json, recipient)
        }
    }
}

/// Parses wire text with the wrapping the connection state expects.
///
/// For Sign-Only, the signature is verified when `sender` is known; during
/// an agent's first `auth` the key arrives inside the payload, so the caller
/// decodes unverified and then checks the signature with [`verify_signed`].
pub fn decode(
    text: &str,
    wrapping: Wrapping,
    keys: &NodeKeyPair,
    sender: Option<&PeerPublicKey>,
) -> Result<Envelope, CodecError> {
    let json = unwrap_text(text, wrapping, keys, sender)?;
    serde_json::from_str(&json).map_err(|_| CodecError::MalformedEnvelope)
}

/// Removes the wrapping and returns the envelope JSON without parsing it.
/// Callers that need to distinguish a bad wrapping from a bad envelope (the
/// receive loop ignores frames with no usable `type`) unwrap first and parse
/// themselves.
pub fn unwrap_text(
    text: &str,
    wrapping: Wrapping,
    keys: &NodeKeyPair,
    sender: Option<&PeerPublicKey>,
) -> Result<String, CodecError> {
    match wrapping {
        Wrapping::PlainText => Ok(text.to_string()),
        Wrapping::SignOnly => {
            if let Some(sender) = sender {
                verify_signed(text, sender)?;
            }
            signed_payload(text)
        }
        Wrapping::Encrypt => decrypt(text, keys),
    }
}

// ─── Sign-Only (compact JWS, RS256) ─────────────────────────────

fn sign(json: &str, keys: &NodeKeyPair) -> String {
    let input = format!(
        "{}.{}",
        B64URL.encode(SIGN_HEADER.as_bytes()),
        B64URL.encode(json.as_bytes())
    );
    let signing_key = SigningKey::<Sha256>::new(keys.private().clone());
    let signature = signing_key.sign(input.as_bytes());
    format!("{}.{}", input, B64URL.encode(signature.to_bytes()))
}

/// Checks the RS256 signature of a Sign-Only frame against the sender's key.
pub fn verify_signed(text: &str, sender: &PeerPublicKey) -> Result<(), CodecError> {
    let (header_b64, payload_b64, signature_b64) = split3(text)?;
    let signature_bytes = B64URL
        .decode(signature_b64)
        .map_err(|_| CodecError::MalformedEnvelope)?;
    let signature = Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?;
    let input = format!("{}.{}", header_b64, payload_b64);
    let verifying_key = VerifyingKey::<Sha256>::new(sender.key().clone());
    verifying_key
        .verify(input.as_bytes(), &signature)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)
}

/// Extracts the payload JSON of a Sign-Only frame after structural checks.
fn signed_payload(text: &str) -> Result<String, CodecError> {
    let (header_b64, payload_b64, _) = split3(text)?;
    check_header(header_b64, false)?;
    let payload = B64URL
        .decode(payload_b64)
        .map_err(|_| CodecError::MalformedEnvelope)?;
    String::from_utf8(payload).map_err(|_| CodecError::MalformedEnvelope)
}

// ─── Encrypt (compact JWE, RSA-OAEP-256 + A256CBC-HS512) ────────

fn encrypt(json: &str, recipient: &PeerPublicKey) -> Result<String, CodecError> {
    let mut rng = rand::thread_rng();

    let mut cek = [0u8; CEK_LEN];
    rng.fill_bytes(&mut cek);
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut iv);

    let encrypted_key = recipient
        .key()
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &cek)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?;

    let ciphertext = Aes256CbcEnc::new_from_slices(&cek[32..], &iv)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?
        .encrypt_padded_vec_mut::<Pkcs7>(json.as_bytes());

    let header_b64 = B64URL.encode(ENCRYPT_HEADER.as_bytes());
    let tag = authentication_tag(&cek[..32], header_b64.as_bytes(), &iv, &ciphertext);

    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        B64URL.encode(encrypted_key),
        B64URL.encode(iv),
        B64URL.encode(&ciphertext),
        B64URL.encode(&tag[..TAG_LEN])
    ))
}

fn decrypt(text: &str, keys: &NodeKeyPair) -> Result<String, CodecError> {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
        return Err(CodecError::MalformedEnvelope);
    }
    check_header(parts[0], true)?;

    let encrypted_key = B64URL
        .decode(parts[1])
        .map_err(|_| CodecError::MalformedEnvelope)?;
    let iv = B64URL
        .decode(parts[2])
        .map_err(|_| CodecError::MalformedEnvelope)?;
    let ciphertext = B64URL
        .decode(parts[3])
        .map_err(|_| CodecError::MalformedEnvelope)?;
    let tag = B64URL
        .decode(parts[4])
        .map_err(|_| CodecError::MalformedEnvelope)?;

    let cek = keys
        .private()
        .decrypt(Oaep::new::<Sha256>(), &encrypted_key)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?;
    if cek.len() != CEK_LEN || iv.len() != IV_LEN {
        return Err(CodecError::InvalidConnectionStateForAuthentication);
    }

    let mut mac = Hmac::<Sha512>::new_from_slice(&cek[..32])
        .expect("hmac accepts keys of any length");
    mac.update(parts[0].as_bytes());
    mac.update(&iv);
    mac.update(&ciphertext);
    mac.update(&((parts[0].len() as u64) * 8).to_be_bytes());
    mac.verify_truncated_left(&tag)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?;

    let plaintext = Aes256CbcDec::new_from_slices(&cek[32..], &iv)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CodecError::InvalidConnectionStateForAuthentication)?;
    String::from_utf8(plaintext).map_err(|_| CodecError::InvalidConnectionStateForAuthentication)
}

/// HMAC-SHA-512 over AAD || IV || ciphertext || bitlen(AAD), per RFC 7518.
fn authentication_tag(mac_key: &[u8], aad: &[u8], iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(mac_key).expect("hmac accepts keys of any length");
    mac.update(aad);
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(&((aad.len() as u64) * 8).to_be_bytes());
    mac.finalize().into_bytes().to_vec()
}

// ─── Shared helpers ─────────────────────────────────────────────

fn split3(text: &str) -> Result<(&str, &str, &str), CodecError> {
    let parts: Vec<&str> = text.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(CodecError::MalformedEnvelope);
    }
    Ok((parts[0], parts[1], parts[2]))
}

/// Parses a protected header and checks its `encrypted` marker matches the
/// wrapping being decoded.
fn check_header(header_b64: &str, encrypted: bool) -> Result<(), CodecError> {
    let raw = B64URL
        .decode(header_b64)
        .map_err(|_| CodecError::MalformedEnvelope)?;
    let header: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|_| CodecError::MalformedEnvelope)?;
    let expected = if encrypted { "true" } else { "false" };
    match header.get("encrypted").and_then(|v| v.as_str()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(CodecError::MalformedEnvelope),
    }
}
