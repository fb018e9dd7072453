//! # Record Model
//!
//! The versioned unit exchanged with the DHT.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Slot`] | `(location, domain, content)` address of one logical record |
//! | [`VersionKey`] | `(timestamp, 160-bit content digest)`, totally ordered |
//! | [`Record`] | payload + version linkage + optional protection key |
//! | [`Digest`] | per-replica summary of a slot's version chain |
//!
//! ## Version Keys
//!
//! A version key orders first by wall-clock timestamp (milliseconds) and then
//! by its digest bytes. The derived `Ord` is that total order, which the put
//! protocol uses as its deterministic tie-break. [`VersionKey::ZERO`] marks
//! "no parent" in `based_on` and "unversioned" in `version`.

use serde::{Deserialize, Serialize};

use crate::identity::{now_ms, Identity};

/// Key type for slot components (32-byte hash).
pub type Key = [u8; 32];

/// Size of the content-derived part of a version key (160 bits).
pub const VERSION_DIGEST_LEN: usize = 20;

/// Default record time-to-live (one year). Profiles and file metadata are
/// expected to be refreshed by their owner long before this.
pub const DEFAULT_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Domain separation prefix for deriving slot keys from names.
const SLOT_KEY_DOMAIN: &[u8] = b"tessera-slot-v1:";

/// Domain separation prefix for deriving version digests.
const VERSION_DIGEST_DOMAIN: &[u8] = b"tessera-version-v1:";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub location: Key,
    pub domain: Key,
    pub content: Key,
}

impl Slot {
    pub fn new(location: Key, domain: Key, content: Key) -> Self {
        Self { location, domain, content }
    }

    /// Derive a slot from human-readable names by hashing each component.
    pub fn from_names(location: &str, domain: &str, content: &str) -> Self {
        Self {
            location: name_key(location),
            domain: name_key(domain),
            content: name_key(content),
        }
    }
}

fn name_key(name: &str) -> Key {
    let mut hasher = blake3::Hasher::new();
    hasher.update(SLOT_KEY_DOMAIN);
    hasher.update(name.as_bytes());
    *hasher.finalize().as_bytes()
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Slot({})", self)
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            hex::encode(&self.location[..4]),
            hex::encode(&self.domain[..4]),
            hex::encode(&self.content[..4])
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct VersionKey {
    timestamp_ms: u64,
    digest: [u8; VERSION_DIGEST_LEN],
}

impl VersionKey {
    pub const ZERO: VersionKey = VersionKey {
        timestamp_ms: 0,
        digest: [0u8; VERSION_DIGEST_LEN],
    };

    pub fn new(timestamp_ms: u64, digest: [u8; VERSION_DIGEST_LEN]) -> Self {
        Self { timestamp_ms, digest }
    }

    /// Derive the version key for `payload` written on top of `based_on`.
    ///
    /// The timestamp is the local clock, but never earlier than one
    /// millisecond past the parent so that a successor always sorts after it.
    pub fn derive(based_on: &VersionKey, payload: &[u8]) -> Self {
        let floor = if based_on.is_zero() { 0 } else { based_on.timestamp_ms + 1 };
        Self::derive_at(now_ms().max(floor), based_on, payload)
    }

    /// Derive a version key with an explicit timestamp.
    pub fn derive_at(timestamp_ms: u64, based_on: &VersionKey, payload: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(VERSION_DIGEST_DOMAIN);
        hasher.update(&based_on.timestamp_ms.to_be_bytes());
        hasher.update(&based_on.digest);
        hasher.update(payload);
        let hash = hasher.finalize();
        let mut digest = [0u8; VERSION_DIGEST_LEN];
        digest.copy_from_slice(&hash.as_bytes()[..VERSION_DIGEST_LEN]);
        Self { timestamp_ms, digest }
    }

    #[inline]
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    #[inline]
    pub fn digest(&self) -> &[u8; VERSION_DIGEST_LEN] {
        &self.digest
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn to_bytes(&self) -> [u8; 8 + VERSION_DIGEST_LEN] {
        let mut out = [0u8; 8 + VERSION_DIGEST_LEN];
        out[..8].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        out[8..].copy_from_slice(&self.digest);
        out
    }
}

impl std::fmt::Debug for VersionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VersionKey({})", self)
    }
}

impl std::fmt::Display for VersionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.timestamp_ms, hex::encode(&self.digest[..6]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub version: VersionKey,
    pub based_on: VersionKey,
    pub payload: Vec<u8>,
    pub ttl_secs: u64,
    /// Public half of the slot's protection key, if the slot is owned.
    pub protection: Option<Identity>,
}

impl Record {
    /// First version of a slot (`based_on` is ZERO).
    pub fn first(payload: Vec<u8>) -> Self {
        Self::successor(VersionKey::ZERO, payload)
    }

    /// Version written on top of `based_on`.
    pub fn successor(based_on: VersionKey, payload: Vec<u8>) -> Self {
        let version = VersionKey::derive(&based_on, &payload);
        Self {
            version,
            based_on,
            payload,
            ttl_secs: DEFAULT_TTL_SECS,
            protection: None,
        }
    }

    /// Unversioned record: replaces whatever unversioned value the slot holds.
    pub fn unversioned(payload: Vec<u8>) -> Self {
        Self {
            version: VersionKey::ZERO,
            based_on: VersionKey::ZERO,
            payload,
            ttl_secs: DEFAULT_TTL_SECS,
            protection: None,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn protected_by(mut self, owner: Identity) -> Self {
        self.protection = Some(owner);
        self
    }

    pub fn is_unversioned(&self) -> bool {
        self.version.is_zero() && self.based_on.is_zero()
    }
}

/// One entry of a replica's chain summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub version: VersionKey,
    pub based_on: VersionKey,
}

/// Ordered (oldest first) summary of one replica's chain for one slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub entries: Vec<DigestEntry>,
}

impl Digest {
    pub fn head(&self) -> Option<&DigestEntry> {
        self.entries.last()
    }

    pub fn contains(&self, version: &VersionKey) -> bool {
        self.entries.iter().any(|e| e.version == *version)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Inclusive version range for digest requests. `None` bounds are open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRange {
    pub from: Option<VersionKey>,
    pub to: Option<VersionKey>,
}

impl DigestRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, version: &VersionKey) -> bool {
        self.from.is_none_or(|from| *version >= from) && self.to.is_none_or(|to| *version <= to)
    }
}
