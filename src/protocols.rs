//! Substrate trait consumed by the consistency protocols.
//!
//! The put, get and remove protocols never talk to replicas directly. They
//! fan a request out through a [`StorageRpc`] implementation, which decides
//! which replicas are responsible for a slot and returns one answer per
//! replica that replied.
//!
//! | Operation | Per-replica answer |
//! |-----------|--------------------|
//! | `put` | [`PutStatus`] |
//! | `get` | `Option<Record>` |
//! | `remove` | [`RemoveStatus`] |
//! | `digest` | [`Digest`] |
//!
//! An `Err` means the request as a whole never reached the replica set
//! (transport failure). Replicas that stay silent are simply absent from the
//! returned list.
//!
//! The in-process implementation lives in [`crate::swarm`].

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Identity;
use crate::messages::{PutRequest, PutStatus, RemoveRequest, RemoveStatus, ReplicaReplies};
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey};

/// Replicated storage primitives for one slot at a time.
#[async_trait]
pub trait StorageRpc: Send + Sync + 'static {
    /// Deliver a (possibly signed) write to every replica responsible for the slot.
    async fn put(&self, request: PutRequest) -> Result<ReplicaReplies<PutStatus>>;

    /// Read the head, or one specific version, from every responsible replica.
    async fn get(&self, slot: Slot, version: Option<VersionKey>) -> Result<ReplicaReplies<Option<Record>>>;

    /// Deliver a (possibly signed) removal to every responsible replica.
    async fn remove(&self, request: RemoveRequest) -> Result<ReplicaReplies<RemoveStatus>>;

    /// Fetch chain summaries. `replicas` restricts the query to the listed
    /// replicas (used to re-examine the ones that reported a conflict).
    async fn digest(
        &self,
        slot: Slot,
        range: DigestRange,
        replicas: Option<&[Identity]>,
    ) -> Result<ReplicaReplies<Digest>>;
}
