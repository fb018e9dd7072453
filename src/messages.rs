//! # Wire Protocol Messages
//!
//! Serializable request, reply and status types exchanged between the client
//! protocols and replicas. Messages are serialized using bincode with size
//! limits to prevent memory exhaustion.
//!
//! | Operation | Request | Per-replica reply |
//! |-----------|---------|-------------------|
//! | Put | [`PutRequest`] | [`PutStatus`] |
//! | Get | `Get { slot, version }` | `Option<Record>` |
//! | Remove | [`RemoveRequest`] | [`RemoveStatus`] |
//! | Digest | `Digest { slot, range }` | [`Digest`] |
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE`: Maximum size of a record payload (1 MiB)
//! - `MAX_DESERIALIZE_SIZE`: Maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{
    put_signed_payload, remove_signed_payload, sign_with_domain, PUT_SIGNATURE_DOMAIN,
    REMOVE_SIGNATURE_DOMAIN,
};
use crate::identity::{Identity, Keypair};
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey};

/// Maximum size of a record payload (1 MiB).
/// Larger files are chunked by the workflows above this layer.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_VALUE_SIZE to allow for message framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Per-replica replies, keyed by the answering replica.
pub type ReplicaReplies<T> = Vec<(Identity, T)>;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Outcome of a put at one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PutStatus {
    Ok,
    /// Generic storage rejection (size, TTL, quota).
    Failed,
    /// `put_if_absent` was set and the slot already holds data.
    FailedNotAbsent,
    /// Signature missing or not made by the slot's protection key.
    FailedSecurity,
    /// `based_on` does not match the chain head.
    VersionConflict,
    /// No parent given but the slot is non-empty.
    VersionConflictNoBasedOn,
    /// Zero version key against a slot whose head is versioned.
    VersionConflictNoVersionKey,
    /// Version timestamp is not newer than the version it claims to follow.
    VersionConflictOldTimestamp,
}

impl PutStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PutStatus::Ok)
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            PutStatus::VersionConflict
                | PutStatus::VersionConflictNoBasedOn
                | PutStatus::VersionConflictNoVersionKey
                | PutStatus::VersionConflictOldTimestamp
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PutStatus::Failed | PutStatus::FailedNotAbsent | PutStatus::FailedSecurity
        )
    }
}

/// Outcome of a removal at one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoveStatus {
    Ok,
    NotFound,
    FailedSecurity,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutRequest {
    /// Node issuing the write (per-writer quota accounting).
    pub from: Identity,
    pub slot: Slot,
    pub record: Record,
    pub put_if_absent: bool,
    /// Explicit key change: the record may name a new protection key when the
    /// request is signed by the current one.
    pub change_protection: bool,
    /// Signature by the caller's protection keys (empty = unsigned).
    pub signature: Vec<u8>,
}

impl PutRequest {
    pub fn new(from: Identity, slot: Slot, record: Record) -> Self {
        Self {
            from,
            slot,
            record,
            put_if_absent: false,
            change_protection: false,
            signature: Vec::new(),
        }
    }

    pub fn put_if_absent(mut self, put_if_absent: bool) -> Self {
        self.put_if_absent = put_if_absent;
        self
    }

    pub fn change_protection(mut self, change_protection: bool) -> Self {
        self.change_protection = change_protection;
        self
    }

    /// Sign the request. Call after all other fields are final.
    pub fn signed(mut self, keys: Option<&Keypair>) -> Self {
        self.signature = match keys {
            Some(keys) => sign_with_domain(keys, PUT_SIGNATURE_DOMAIN, &self.signed_payload()),
            None => Vec::new(),
        };
        self
    }

    pub fn signed_payload(&self) -> Vec<u8> {
        put_signed_payload(&self.slot, &self.record, self.change_protection)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub from: Identity,
    pub slot: Slot,
    /// Version to remove; `None` removes the whole slot.
    pub version: Option<VersionKey>,
    pub signature: Vec<u8>,
}

impl RemoveRequest {
    pub fn new(from: Identity, slot: Slot, version: Option<VersionKey>) -> Self {
        Self {
            from,
            slot,
            version,
            signature: Vec::new(),
        }
    }

    pub fn signed(mut self, keys: Option<&Keypair>) -> Self {
        self.signature = match keys {
            Some(keys) => sign_with_domain(keys, REMOVE_SIGNATURE_DOMAIN, &self.signed_payload()),
            None => Vec::new(),
        };
        self
    }

    pub fn signed_payload(&self) -> Vec<u8> {
        remove_signed_payload(&self.slot, self.version.as_ref())
    }
}

/// Request envelope delivered to a replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StorageRequest {
    Put(PutRequest),
    Get {
        slot: Slot,
        version: Option<VersionKey>,
    },
    Remove(RemoveRequest),
    Digest {
        slot: Slot,
        range: DigestRange,
    },
}

/// Reply envelope returned by a replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StorageResponse {
    Put(PutStatus),
    Value(Option<Record>),
    Remove(RemoveStatus),
    Digest(Digest),
    Error { message: String },
}
