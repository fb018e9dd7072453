//! # Store Client
//!
//! [`StoreClient`] is the entry point business workflows use to read and write
//! versioned records. It wraps a [`StorageRpc`] substrate and runs the put,
//! get and remove protocols over it.
//!
//! | Method | Protocol | Failure |
//! |--------|----------|---------|
//! | [`put`](StoreClient::put) / [`put_with`](StoreClient::put_with) | [`crate::put`] | [`PutFailed`] |
//! | [`get`](StoreClient::get) | read with retry | `None` |
//! | [`get_required`](StoreClient::get_required) | read with retry | [`GetFailed`] |
//! | [`confirm`](StoreClient::confirm) | post-hoc digest check | [`PutFailed`] |
//! | [`remove`](StoreClient::remove) | [`crate::remove`] | [`RemoveFailed`] |
//!
//! Every call resolves fully before returning; retries and conflict resolution
//! happen inside. Absence is not an error for [`get`](StoreClient::get).

use std::fmt;
use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use crate::identity::{Identity, Keypair};
use crate::messages::{PutRequest, ReplicaReplies};
use crate::protocols::StorageRpc;
use crate::put::{confirm_version, PutFailed, PutFailure, PutOperation};
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey, DEFAULT_TTL_SECS};
use crate::remove::{run_remove, RemoveFailed};

/// Default attempt bound for each protocol.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub max_put_attempts: u32,
    pub max_get_attempts: u32,
    pub max_remove_attempts: u32,
    pub retry_backoff: Duration,
    /// Re-check after a successful put that a majority still holds the version.
    pub verify_put: bool,
    /// TTL stamped on records built by higher layers (profile commits).
    pub record_ttl_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_put_attempts: DEFAULT_MAX_ATTEMPTS,
            max_get_attempts: DEFAULT_MAX_ATTEMPTS,
            max_remove_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            verify_put: true,
            record_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

/// Per-write flags carried to the replicas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub put_if_absent: bool,
    pub change_protection: bool,
}

/// A required read never produced a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetFailed {
    pub slot: Slot,
    pub version: Option<VersionKey>,
    pub attempts: u32,
    /// Why the last attempt produced nothing; `None` when replicas answered
    /// and none held the record.
    pub last_error: Option<String>,
}

impl GetFailed {
    /// Replicas were reached and reported the record missing.
    pub fn is_absent(&self) -> bool {
        self.last_error.is_none()
    }
}

impl fmt::Display for GetFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "get of slot {}", self.slot)?;
        if let Some(v) = &self.version {
            write!(f, " at {}", v)?;
        }
        write!(f, " found nothing after {} attempt(s)", self.attempts)?;
        if let Some(e) = &self.last_error {
            write!(f, ": {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for GetFailed {}

pub struct StoreClient<N: StorageRpc> {
    network: Arc<N>,
    config: Arc<ClientConfig>,
    id: Identity,
}

impl<N: StorageRpc> Clone for StoreClient<N> {
    fn clone(&self) -> Self {
        Self {
            network: self.network.clone(),
            config: self.config.clone(),
            id: self.id,
        }
    }
}

impl<N: StorageRpc> StoreClient<N> {
    /// `id` names this client to replicas for per-writer accounting.
    pub fn new(network: N, id: Identity, config: ClientConfig) -> Self {
        Self::from_shared(Arc::new(network), id, config)
    }

    pub fn from_shared(network: Arc<N>, id: Identity, config: ClientConfig) -> Self {
        Self {
            network,
            config: Arc::new(config),
            id,
        }
    }

    pub fn identity(&self) -> Identity {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub async fn put(&self, slot: Slot, record: Record, keys: Option<&Keypair>) -> Result<VersionKey, PutFailed> {
        self.put_with(slot, record, keys, PutOptions::default()).await
    }

    pub async fn put_with(
        &self,
        slot: Slot,
        record: Record,
        keys: Option<&Keypair>,
        options: PutOptions,
    ) -> Result<VersionKey, PutFailed> {
        let request = PutRequest::new(self.id, slot, record)
            .put_if_absent(options.put_if_absent)
            .change_protection(options.change_protection)
            .signed(keys);
        PutOperation::new(self.network.as_ref(), &self.config, keys, self.id, request)
            .run()
            .await
    }

    /// Best-effort read: the newest head (or the requested version) among
    /// replica answers, or `None` once retries are exhausted.
    pub async fn get(&self, slot: Slot, version: Option<VersionKey>) -> Option<Record> {
        self.read(slot, version).await.ok()
    }

    /// Like [`get`](Self::get), but absence after retries is an error.
    pub async fn get_required(&self, slot: Slot, version: Option<VersionKey>) -> Result<Record, GetFailed> {
        self.read(slot, version).await
    }

    async fn read(&self, slot: Slot, version: Option<VersionKey>) -> Result<Record, GetFailed> {
        let max_attempts = self.config.max_get_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.network.get(slot, version).await {
                Ok(replies) => {
                    let answered = replies.len();
                    let newest = replies
                        .into_iter()
                        .filter_map(|(_, record)| record)
                        .max_by_key(|record| record.version);
                    if let Some(record) = newest {
                        trace!(slot = %slot, version = %record.version, attempt, "read resolved");
                        return Ok(record);
                    }
                    trace!(slot = %slot, attempt, answered, "read came back empty");
                    last_error = (answered == 0).then(|| "no replica answered".to_string());
                }
                Err(e) => {
                    debug!(slot = %slot, attempt, error = %e, "read transport failure");
                    last_error = Some(e.to_string());
                }
            }
            if attempt < max_attempts {
                sleep(self.config.retry_backoff).await;
            }
        }
        Err(GetFailed {
            slot,
            version,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Per-replica chain summaries for `slot`.
    pub async fn get_digest(&self, slot: Slot) -> anyhow::Result<ReplicaReplies<Digest>> {
        self.network.digest(slot, DigestRange::all(), None).await
    }

    /// Check after the fact that `version` is still held by a majority of the
    /// answering replicas, as head or in history.
    pub async fn confirm(&self, slot: Slot, version: VersionKey) -> Result<(), PutFailed> {
        let held = match confirm_version(self.network.as_ref(), slot, version).await {
            Ok(held) => held,
            Err(e) => {
                debug!(slot = %slot, version = %version, error = %e, "confirmation digest failed");
                false
            }
        };
        if held {
            Ok(())
        } else {
            Err(PutFailed {
                slot,
                version,
                reason: PutFailure::VersionLost,
                attempts: 0,
                statuses: Vec::new(),
            })
        }
    }

    /// Remove one version, or the whole slot when `version` is `None`.
    pub async fn remove(
        &self,
        slot: Slot,
        version: Option<VersionKey>,
        keys: Option<&Keypair>,
    ) -> Result<(), RemoveFailed> {
        run_remove(self.network.as_ref(), &self.config, self.id, slot, version, keys).await
    }
}
