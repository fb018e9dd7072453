//! # Put Protocol
//!
//! Client-side orchestration of one versioned write across the replica set.
//! A write is all-or-nothing: the caller either receives the committed
//! [`VersionKey`] or a [`PutFailed`], and in the failure case removal of any
//! partially written copies has already been attempted.
//!
//! ## State Machine
//!
//! ```text
//!  Sending ──► AwaitingReplies ◄── Reissuing
//!     ▲              │    │              ▲
//!     │              │    ▼              │
//!     │              │  ResolvingConflict ──┐
//!     │              │    │                 │
//!     │              │    └──► Verifying ◄──┤
//!     │              ▼            │         │
//!     └──────── Retrying          ▼         │
//!                    └────────► Done ◄──────┘
//! ```
//!
//! ## Decision Rules
//!
//! - Transport error or no replies: retry.
//! - Any `VersionConflict*` reply: fetch digests from the conflicting replicas
//!   and adjudicate by timestamp, then by version key. A newer head means we
//!   lost the race. An older head that shares our parent is a stale fork:
//!   it is removed and the write re-issued without spending an attempt. A fork
//!   that survives every re-issue, like any other older head, belongs to a
//!   lagging replica and counts as accepting. A first version meeting any
//!   other head can never be appended there, so the write is lost.
//! - Otherwise the write succeeds when `failures * 2 < replies`.
//! - A failed majority that includes `FailedSecurity` or `FailedNotAbsent`
//!   is terminal; other failed majorities are retried until the attempt bound.
//! - On success the write is optionally confirmed: a majority of answering
//!   replicas must still hold the version as head or in history.

use std::fmt;

use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::client::ClientConfig;
use crate::identity::{Identity, Keypair};
use crate::messages::{PutRequest, PutStatus, RemoveRequest, ReplicaReplies};
use crate::protocols::StorageRpc;
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey};

// ============================================================================
// Errors
// ============================================================================

/// Why a put was reported failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutFailure {
    /// Every attempt ended in a failed majority or a transport error.
    RetriesExhausted,
    /// A conflicting replica holds a head that wins the tie-break.
    LostRace,
    /// A majority rejected the signature; retrying cannot fix a wrong key.
    SecurityRejected,
    /// `put_if_absent` was set and the slot already holds data.
    NotAbsent,
    /// The version was accepted but no longer held by a majority afterwards.
    VersionLost,
}

impl fmt::Display for PutFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PutFailure::RetriesExhausted => write!(f, "retries exhausted"),
            PutFailure::LostRace => write!(f, "lost the race to a newer version"),
            PutFailure::SecurityRejected => write!(f, "rejected by ownership check"),
            PutFailure::NotAbsent => write!(f, "slot is not absent"),
            PutFailure::VersionLost => write!(f, "version no longer held by a majority"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutFailed {
    pub slot: Slot,
    pub version: VersionKey,
    pub reason: PutFailure,
    pub attempts: u32,
    /// Last per-replica statuses observed.
    pub statuses: ReplicaReplies<PutStatus>,
}

impl PutFailed {
    /// Whether re-deriving the write from a fresh read may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            PutFailure::RetriesExhausted | PutFailure::LostRace | PutFailure::VersionLost
        )
    }

    /// Whether another writer's version displaced this one.
    pub fn is_conflict(&self) -> bool {
        matches!(self.reason, PutFailure::LostRace | PutFailure::VersionLost)
    }
}

impl fmt::Display for PutFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "put of {} to slot {} failed after {} attempt(s): {}",
            self.version, self.slot, self.attempts, self.reason
        )
    }
}

impl std::error::Error for PutFailed {}

// ============================================================================
// Pending Write
// ============================================================================

/// Client-side bookkeeping for one put; owned by the operation driving it.
#[derive(Debug)]
pub struct PendingWrite {
    pub slot: Slot,
    pub record: Record,
    request: PutRequest,
    pub attempt: u32,
    /// Re-issues after stale-fork removal; these do not count as attempts.
    pub reissues: u32,
    pub replies: ReplicaReplies<PutStatus>,
}

impl PendingWrite {
    pub fn new(request: PutRequest) -> Self {
        Self {
            slot: request.slot,
            record: request.record.clone(),
            request,
            attempt: 0,
            reissues: 0,
            replies: Vec::new(),
        }
    }

    pub fn version(&self) -> VersionKey {
        self.record.version
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug)]
enum PutState {
    Sending,
    AwaitingReplies(anyhow::Result<ReplicaReplies<PutStatus>>),
    ResolvingConflict(Vec<Identity>),
    Reissuing,
    Retrying,
    Verifying,
    Done(Result<VersionKey, PutFailed>),
}

/// Outcome of comparing our record against one conflicting replica's head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Adjudication {
    Lost,
    /// Another first version already roots the slot's chain.
    RootTaken,
    StaleFork(VersionKey),
    Lagging,
}

pub(crate) struct PutOperation<'a, N: StorageRpc> {
    network: &'a N,
    config: &'a ClientConfig,
    keys: Option<&'a Keypair>,
    from: Identity,
    write: PendingWrite,
}

impl<'a, N: StorageRpc> PutOperation<'a, N> {
    pub(crate) fn new(
        network: &'a N,
        config: &'a ClientConfig,
        keys: Option<&'a Keypair>,
        from: Identity,
        request: PutRequest,
    ) -> Self {
        Self {
            network,
            config,
            keys,
            from,
            write: PendingWrite::new(request),
        }
    }

    pub(crate) async fn run(mut self) -> Result<VersionKey, PutFailed> {
        let mut state = PutState::Sending;
        loop {
            trace!(slot = %self.write.slot, version = %self.write.version(), state = ?state, "put state");
            state = match state {
                PutState::Sending => {
                    self.write.attempt += 1;
                    debug!(
                        slot = %self.write.slot,
                        version = %self.write.version(),
                        attempt = self.write.attempt,
                        "sending put"
                    );
                    PutState::AwaitingReplies(self.network.put(self.write.request.clone()).await)
                }
                PutState::AwaitingReplies(Err(e)) => {
                    warn!(slot = %self.write.slot, attempt = self.write.attempt, error = %e, "put transport failure");
                    PutState::Retrying
                }
                PutState::AwaitingReplies(Ok(replies)) => self.evaluate(replies).await,
                PutState::ResolvingConflict(conflicting) => self.resolve_conflict(conflicting).await,
                PutState::Reissuing => {
                    self.write.reissues += 1;
                    debug!(
                        slot = %self.write.slot,
                        version = %self.write.version(),
                        reissues = self.write.reissues,
                        "re-issuing put after removing stale forks"
                    );
                    PutState::AwaitingReplies(self.network.put(self.write.request.clone()).await)
                }
                PutState::Retrying => self.retry().await,
                PutState::Verifying => match self.verify().await {
                    Ok(()) => PutState::Done(Ok(self.write.version())),
                    Err(reason) => {
                        self.cleanup().await;
                        PutState::Done(Err(self.failed(reason)))
                    }
                },
                PutState::Done(result) => {
                    match &result {
                        Ok(version) => info!(slot = %self.write.slot, version = %version, attempts = self.write.attempt, "put committed"),
                        Err(e) => warn!(slot = %self.write.slot, version = %e.version, reason = %e.reason, attempts = e.attempts, "put failed"),
                    }
                    return result;
                }
            };
        }
    }

    async fn evaluate(&mut self, replies: ReplicaReplies<PutStatus>) -> PutState {
        self.write.replies = replies;
        let replies = &self.write.replies;
        if replies.is_empty() {
            debug!(slot = %self.write.slot, attempt = self.write.attempt, "no replica answered");
            return PutState::Retrying;
        }

        let conflicting: Vec<Identity> = replies
            .iter()
            .filter(|(_, s)| s.is_version_conflict())
            .map(|(id, _)| *id)
            .collect();
        if !conflicting.is_empty() {
            return PutState::ResolvingConflict(conflicting);
        }

        let failures = replies.iter().filter(|(_, s)| s.is_failure()).count();
        if failures * 2 < replies.len() {
            return self.accepted();
        }

        let terminal = if replies.iter().any(|(_, s)| *s == PutStatus::FailedSecurity) {
            Some(PutFailure::SecurityRejected)
        } else if replies.iter().any(|(_, s)| *s == PutStatus::FailedNotAbsent) {
            Some(PutFailure::NotAbsent)
        } else {
            None
        };
        match terminal {
            Some(reason) => {
                self.cleanup().await;
                PutState::Done(Err(self.failed(reason)))
            }
            None => {
                debug!(
                    slot = %self.write.slot,
                    failures,
                    replies = self.write.replies.len(),
                    "majority rejected put"
                );
                PutState::Retrying
            }
        }
    }

    fn accepted(&self) -> PutState {
        if self.config.verify_put {
            PutState::Verifying
        } else {
            PutState::Done(Ok(self.write.version()))
        }
    }

    async fn resolve_conflict(&mut self, conflicting: Vec<Identity>) -> PutState {
        let digests = match self
            .network
            .digest(self.write.slot, DigestRange::all(), Some(conflicting.as_slice()))
            .await
        {
            Ok(digests) => digests,
            Err(e) => {
                warn!(slot = %self.write.slot, error = %e, "digest fetch for conflict resolution failed");
                return PutState::Retrying;
            }
        };

        let mut forks = Vec::new();
        let mut fork_replicas = 0usize;
        let mut lagging = 0usize;
        for (replica, digest) in &digests {
            match adjudicate(&self.write.record, digest) {
                Adjudication::Lost => {
                    info!(
                        slot = %self.write.slot,
                        version = %self.write.version(),
                        replica = %replica.short_hex(),
                        head = ?digest.head().map(|h| h.version),
                        "lost race to a newer version"
                    );
                    self.cleanup().await;
                    return PutState::Done(Err(self.failed(PutFailure::LostRace)));
                }
                Adjudication::RootTaken => {
                    info!(
                        slot = %self.write.slot,
                        version = %self.write.version(),
                        replica = %replica.short_hex(),
                        head = ?digest.head().map(|h| h.version),
                        "slot already has a first version"
                    );
                    self.cleanup().await;
                    return PutState::Done(Err(self.failed(PutFailure::VersionLost)));
                }
                Adjudication::StaleFork(fork) => {
                    fork_replicas += 1;
                    if !forks.contains(&fork) {
                        forks.push(fork);
                    }
                }
                Adjudication::Lagging => lagging += 1,
            }
        }

        if !forks.is_empty() {
            if self.write.reissues < self.config.max_put_attempts {
                for fork in &forks {
                    debug!(slot = %self.write.slot, fork = %fork, "removing stale fork before re-issuing put");
                    self.remove_version(*fork).await;
                }
                return PutState::Reissuing;
            }
            warn!(
                slot = %self.write.slot,
                forks = forks.len(),
                "stale forks persist; counting their replicas as lagging"
            );
            lagging += fork_replicas;
        }

        // Lagging replicas count as accepting; silent ones as failed.
        let silent = conflicting.len() - lagging;
        let failures = self.write.replies.iter().filter(|(_, s)| s.is_failure()).count() + silent;
        if failures * 2 < self.write.replies.len() {
            self.accepted()
        } else {
            PutState::Retrying
        }
    }

    async fn retry(&mut self) -> PutState {
        self.cleanup().await;
        if self.write.attempt >= self.config.max_put_attempts {
            return PutState::Done(Err(self.failed(PutFailure::RetriesExhausted)));
        }
        sleep(self.config.retry_backoff).await;
        PutState::Sending
    }

    async fn verify(&self) -> Result<(), PutFailure> {
        let version = self.write.version();
        match confirm_version(self.network, self.write.slot, version).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(slot = %self.write.slot, version = %version, "version not held by a majority after put");
                Err(PutFailure::VersionLost)
            }
            Err(e) => {
                warn!(slot = %self.write.slot, version = %version, error = %e, "could not confirm put");
                Err(PutFailure::VersionLost)
            }
        }
    }

    /// Remove any copies of this write's version.
    async fn cleanup(&self) {
        if self.write.record.version.is_zero() {
            return;
        }
        self.remove_version(self.write.version()).await;
    }

    async fn remove_version(&self, version: VersionKey) {
        let request = RemoveRequest::new(self.from, self.write.slot, Some(version)).signed(self.keys);
        match self.network.remove(request).await {
            Ok(statuses) => trace!(slot = %self.write.slot, version = %version, replies = statuses.len(), "removed version"),
            Err(e) => warn!(slot = %self.write.slot, version = %version, error = %e, "cleanup failed"),
        }
    }

    fn failed(&self, reason: PutFailure) -> PutFailed {
        PutFailed {
            slot: self.write.slot,
            version: self.write.version(),
            reason,
            attempts: self.write.attempt,
            statuses: self.write.replies.clone(),
        }
    }
}

fn adjudicate(record: &Record, digest: &Digest) -> Adjudication {
    let Some(head) = digest.head() else {
        return Adjudication::Lagging;
    };
    let ours = record.version;
    let theirs = head.version;
    if ours == theirs {
        error!(version = %ours, "conflicting replica reports our own version as head");
        return Adjudication::Lost;
    }
    // A first version can never be appended behind an existing head.
    if record.based_on.is_zero() {
        return Adjudication::RootTaken;
    }

    let we_win = match ours.timestamp_ms().cmp(&theirs.timestamp_ms()) {
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => ours > theirs,
    };
    if !we_win {
        return Adjudication::Lost;
    }
    if head.based_on == record.based_on {
        Adjudication::StaleFork(theirs)
    } else {
        Adjudication::Lagging
    }
}

/// Whether a majority of answering replicas hold `version` as head or in history.
pub(crate) async fn confirm_version<N: StorageRpc>(network: &N, slot: Slot, version: VersionKey) -> anyhow::Result<bool> {
    let digests = network.digest(slot, DigestRange::all(), None).await?;
    let holding = digests.iter().filter(|(_, d)| d.contains(&version)).count();
    trace!(slot = %slot, version = %version, holding, answered = digests.len(), "confirmation digest");
    Ok(holding * 2 > digests.len())
}
