//! # Request Signatures
//!
//! Ownership of a protected slot is proven by signing the write or removal with
//! the slot's protection key:
//!
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//! - **Payload binding**: A signature covers the slot, the version linkage and a
//!   BLAKE3 hash of the payload, so it cannot be moved to another slot or
//!   replayed with different content
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted
//! - Verification is strict (`verify_strict`, rejects malleable encodings)
//! - Domain separation prevents a put signature from authorizing a removal

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Identity, Keypair};
use crate::record::{Record, Slot, VersionKey};

// ============================================================================
// Errors
// ============================================================================

/// Why a request signature did not prove ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// The request carried no signature for a protected slot.
    Missing,
    /// Not a 64-byte Ed25519 signature.
    InvalidLength,
    /// Signed by some other key, or over other bytes.
    VerificationFailed,
    /// The slot's protection key is not a usable Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SignatureError::Missing => "request is unsigned",
            SignatureError::InvalidLength => "malformed signature",
            SignatureError::VerificationFailed => "signature does not match the protection key",
            SignatureError::InvalidPublicKey => "protection key is not a valid Ed25519 key",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domains
// ============================================================================

pub const PUT_SIGNATURE_DOMAIN: &[u8] = b"tessera-put-v1:";
pub const REMOVE_SIGNATURE_DOMAIN: &[u8] = b"tessera-remove-v1:";

/// The bytes actually signed: `domain || data`.
fn domain_message(domain: &[u8], data: &[u8]) -> Vec<u8> {
    [domain, data].concat()
}

/// Sign `data` under `domain` with a slot owner's key.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&domain_message(domain, data)).to_bytes().to_vec()
}

/// Check that `owner` signed `data` under `domain`.
pub fn verify_with_domain(owner: &Identity, domain: &[u8], data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let signature = Signature::from_slice(signature).map_err(|_| SignatureError::InvalidLength)?;
    let key = VerifyingKey::from_bytes(owner.as_bytes()).map_err(|_| SignatureError::InvalidPublicKey)?;
    key.verify_strict(&domain_message(domain, data), &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Request Payloads
// ============================================================================

fn push_slot(buf: &mut Vec<u8>, slot: &Slot) {
    buf.extend_from_slice(&slot.location);
    buf.extend_from_slice(&slot.domain);
    buf.extend_from_slice(&slot.content);
}

/// Bytes covered by a put signature.
pub fn put_signed_payload(slot: &Slot, record: &Record, change_protection: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96 + 2 * 28 + 32 + 8 + 34);
    push_slot(&mut buf, slot);
    buf.extend_from_slice(&record.version.to_bytes());
    buf.extend_from_slice(&record.based_on.to_bytes());
    buf.extend_from_slice(blake3::hash(&record.payload).as_bytes());
    buf.extend_from_slice(&record.ttl_secs.to_be_bytes());
    match &record.protection {
        Some(owner) => {
            buf.push(1);
            buf.extend_from_slice(owner.as_bytes());
        }
        None => buf.push(0),
    }
    buf.push(change_protection as u8);
    buf
}

/// Bytes covered by a remove signature. `None` targets the whole slot.
pub fn remove_signed_payload(slot: &Slot, version: Option<&VersionKey>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(96 + 29);
    push_slot(&mut buf, slot);
    match version {
        Some(v) => {
            buf.push(1);
            buf.extend_from_slice(&v.to_bytes());
        }
        None => buf.push(0),
    }
    buf
}
