//! # Tessera - Versioned Records over a Replicated DHT
//!
//! Tessera is the consistency layer between business workflows and a shared
//! DHT. Every durable artifact (user profile, file metadata, chunks) is a
//! versioned record addressed by a [`Slot`], and Tessera decides what it means
//! for a write to that slot to have happened:
//!
//! - **Validation**: each replica accepts a write only if it extends the slot's
//!   version chain and carries a valid owner signature
//! - **Put protocol**: majority accept, timestamp tie-break on conflicts,
//!   bounded retries with cleanup, post-hoc confirmation
//! - **Get / remove protocols**: read with retry, delete with verification
//! - **Profile manager**: a single-writer FIFO queue for the user profile
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - A public handle ([`ReplicaNode`], [`ProfileManager`]) is cheap to clone
//!   and talks to a private actor over channels
//! - The actor owns all mutable state and processes commands sequentially
//!
//! The protocols reach replicas only through the [`StorageRpc`] trait. The
//! in-process [`LocalSwarm`] implements it for tests and the demo binary.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key
//! - Protected slots accept writes and removals only when signed by the
//!   slot's protection key (domain-separated signatures)
//! - Wire decoding is size-bounded; replica state is bounded per writer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `record` | Slots, version keys, records, digests |
//! | `identity` | Keypairs and identities |
//! | `crypto` | Domain-separated request signatures |
//! | `messages` | Wire types and status taxonomy |
//! | `storage` | Node-local write validator and version chains |
//! | `replica` | Replica actor owning one store |
//! | `protocols` | Substrate trait (`StorageRpc`) |
//! | `swarm` | In-process replica swarm with fault injection |
//! | `put` | Put protocol state machine |
//! | `remove` | Remove protocol |
//! | `client` | `StoreClient` facade, get protocol, configuration |
//! | `profile` | Single-writer profile manager |

mod client;
mod crypto;
mod identity;
mod messages;
mod profile;
mod protocols;
mod put;
mod record;
mod remove;
mod replica;
mod storage;
mod swarm;

pub use client::{ClientConfig, GetFailed, PutOptions, StoreClient, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF};
pub use crypto::{SignatureError, PUT_SIGNATURE_DOMAIN, REMOVE_SIGNATURE_DOMAIN};
pub use identity::{Identity, Keypair};
pub use messages::{
    PutRequest, PutStatus, RemoveRequest, RemoveStatus, ReplicaReplies, StorageRequest, StorageResponse,
    MAX_VALUE_SIZE,
};
pub use profile::{
    CallerId, FileEntry, ProfileConfig, ProfileError, ProfileManager, ProfileSnapshot, ProfileTelemetry,
    UserProfile,
};
pub use protocols::StorageRpc;
pub use put::{PendingWrite, PutFailed, PutFailure};
pub use record::{Digest, DigestEntry, DigestRange, Key, Record, Slot, VersionKey, DEFAULT_TTL_SECS};
pub use remove::{RemoveFailed, RemoveFailure};
pub use replica::{ReplicaNode, ReplicaTelemetry};
pub use storage::{
    StoreLimits, StoreStats, VersionedStore, MAX_RECORD_TTL, MAX_VERSIONS_HISTORY, MIN_VERSION_AGE_BEFORE_REMOVAL,
};
pub use swarm::{LocalSwarm, SwarmCalls, SwarmConfig, DEFAULT_REPLICATION_FACTOR};
