//! # Versioned Local Storage (Node-Local Write Validator)
//!
//! Every replica holds a [`VersionedStore`] and runs each incoming write through
//! it before acknowledging. A slot's accepted versions form one linear chain;
//! the validator answers with exactly one [`PutStatus`] per request.
//!
//! ## Check Order
//!
//! The first failing check decides the status:
//!
//! 1. storage limits (size, TTL, per-writer quota and rate) → `Failed`
//! 2. `put_if_absent` on a non-empty slot → `FailedNotAbsent`
//! 3. ownership (signature against the stored protection key) → `FailedSecurity`
//! 4. version linkage → one of the `VersionConflict*` statuses
//!
//! On `Ok` the record is appended and history beyond the retention bound is
//! pruned, oldest first, once it is old enough. The head is never pruned.
//!
//! Replicas decide independently; reconciling divergent answers is the client's
//! job (see [`crate::put`]).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::crypto::{verify_with_domain, SignatureError, PUT_SIGNATURE_DOMAIN, REMOVE_SIGNATURE_DOMAIN};
use crate::identity::Identity;
use crate::messages::{PutRequest, PutStatus, RemoveRequest, RemoveStatus, MAX_VALUE_SIZE};
use crate::record::{Digest, DigestEntry, DigestRange, Record, Slot, VersionKey};

/// Maximum number of versions retained per slot.
pub const MAX_VERSIONS_HISTORY: usize = 5;

/// Minimum age of a history entry before it may be pruned.
pub const MIN_VERSION_AGE_BEFORE_REMOVAL: Duration = Duration::from_secs(5 * 60);

/// Longest TTL a replica honours (ten years).
pub const MAX_RECORD_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Maximum number of slots a single replica holds.
const MAX_SLOTS: usize = 100_000;

/// Maximum bytes a single writer can have stored on one replica (64 MiB).
const PER_WRITER_STORAGE_QUOTA: usize = 64 * 1024 * 1024;

/// Maximum store requests per writer per window.
const PER_WRITER_RATE_LIMIT: usize = 1_000;

/// Time window for per-writer rate limiting.
const PER_WRITER_RATE_WINDOW: Duration = Duration::from_secs(60);

/// Maximum number of writers to track quota for (LRU bounded).
const MAX_TRACKED_WRITERS: usize = 10_000;

/// Limits applied by the validator before any version logic runs.
#[derive(Clone, Debug)]
pub struct StoreLimits {
    pub max_value_size: usize,
    pub max_ttl: Duration,
    pub max_versions: usize,
    pub min_prune_age: Duration,
    pub max_slots: usize,
    pub per_writer_quota: usize,
    pub per_writer_rate_limit: usize,
    pub rate_window: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_value_size: MAX_VALUE_SIZE,
            max_ttl: MAX_RECORD_TTL,
            max_versions: MAX_VERSIONS_HISTORY,
            min_prune_age: MIN_VERSION_AGE_BEFORE_REMOVAL,
            max_slots: MAX_SLOTS,
            per_writer_quota: PER_WRITER_STORAGE_QUOTA,
            per_writer_rate_limit: PER_WRITER_RATE_LIMIT,
            rate_window: PER_WRITER_RATE_WINDOW,
        }
    }
}

#[derive(Clone, Debug)]
struct StoredVersion {
    record: Record,
    stored_by: Identity,
    stored_at: Instant,
    expires_at: Instant,
}

#[derive(Clone, Debug, Default)]
struct SlotChain {
    /// Chain order, oldest first; the last entry is the head.
    versions: Vec<StoredVersion>,
    protection: Option<Identity>,
}

impl SlotChain {
    fn head(&self) -> Option<&StoredVersion> {
        self.versions.last()
    }

    fn position(&self, version: &VersionKey) -> Option<usize> {
        self.versions.iter().position(|v| v.record.version == *version)
    }
}

/// Per-writer accounting for quota and rate enforcement.
#[derive(Debug, Clone, Default)]
struct WriterStats {
    bytes_stored: usize,
    requests: VecDeque<Instant>,
}

impl WriterStats {
    fn is_rate_limited(&mut self, now: Instant, limit: usize, window: Duration) -> bool {
        while let Some(front) = self.requests.front() {
            if now.saturating_duration_since(*front) > window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        self.requests.len() >= limit
    }
}

/// How an accepted write is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acceptance {
    Append,
    ReplaceUnversioned,
    AlreadyHead,
}

/// Summary counters for telemetry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub slots: usize,
    pub versions: usize,
    pub bytes: usize,
}

/// One replica's slots and their version chains.
pub struct VersionedStore {
    slots: HashMap<Slot, SlotChain>,
    writers: LruCache<Identity, WriterStats>,
    limits: StoreLimits,
    bytes: usize,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}

impl VersionedStore {
    pub fn new(limits: StoreLimits) -> Self {
        let cap = NonZeroUsize::new(MAX_TRACKED_WRITERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: HashMap::new(),
            writers: LruCache::new(cap),
            limits,
            bytes: 0,
        }
    }

    pub fn put(&mut self, request: &PutRequest) -> PutStatus {
        self.put_at(request, Instant::now())
    }

    pub fn put_at(&mut self, request: &PutRequest, now: Instant) -> PutStatus {
        let slot = request.slot;
        let record = &request.record;

        let expires_at = match self.check_limits(request, now) {
            Ok(expires_at) => expires_at,
            Err(reason) => {
                debug!(slot = %slot, writer = %request.from.short_hex(), reason, "put rejected: storage limits");
                return PutStatus::Failed;
            }
        };

        let chain = self.slots.get(&slot).filter(|c| !c.versions.is_empty());

        if request.put_if_absent && chain.is_some() {
            debug!(slot = %slot, "put rejected: slot not absent");
            return PutStatus::FailedNotAbsent;
        }

        if let Err(e) = check_put_ownership(chain, request) {
            debug!(slot = %slot, error = %e, "put rejected: ownership check failed");
            return PutStatus::FailedSecurity;
        }

        let acceptance = match check_version(chain, record) {
            Ok(acceptance) => acceptance,
            Err(status) => {
                debug!(
                    slot = %slot,
                    version = %record.version,
                    based_on = %record.based_on,
                    head = ?chain.and_then(|c| c.head()).map(|h| h.record.version),
                    status = ?status,
                    "put rejected: version chain"
                );
                return status;
            }
        };

        if acceptance == Acceptance::AlreadyHead {
            trace!(slot = %slot, version = %record.version, "put is a repeat of the current head");
            return PutStatus::Ok;
        }

        let stored = StoredVersion {
            record: record.clone(),
            stored_by: request.from,
            stored_at: now,
            expires_at,
        };
        let size = record.payload.len();
        let stats = self.writers.get_or_insert_mut(request.from, WriterStats::default);
        stats.bytes_stored = stats.bytes_stored.saturating_add(size);
        stats.requests.push_back(now);
        self.bytes = self.bytes.saturating_add(size);

        let chain = self.slots.entry(slot).or_default();
        if acceptance == Acceptance::ReplaceUnversioned {
            let replaced: Vec<StoredVersion> = chain.versions.drain(..).collect();
            for old in &replaced {
                release_bytes(&mut self.writers, &mut self.bytes, old);
            }
        }
        chain.protection = record.protection;
        chain.versions.push(stored);

        let pruned = prune_history(chain, &self.limits, now);
        for old in &pruned {
            release_bytes(&mut self.writers, &mut self.bytes, old);
        }
        if !pruned.is_empty() {
            trace!(slot = %slot, pruned = pruned.len(), "pruned version history");
        }

        PutStatus::Ok
    }

    /// Returns the expiry instant of the record when every limit holds.
    fn check_limits(&mut self, request: &PutRequest, now: Instant) -> Result<Instant, &'static str> {
        let size = request.record.payload.len();
        if size > self.limits.max_value_size {
            return Err("value too large");
        }
        let ttl = request.record.ttl_secs;
        if ttl == 0 {
            return Err("zero ttl");
        }
        if ttl > self.limits.max_ttl.as_secs() {
            return Err("ttl too long");
        }
        let expires_at = now.checked_add(Duration::from_secs(ttl)).ok_or("ttl overflows clock")?;
        if !self.slots.contains_key(&request.slot) && self.slots.len() >= self.limits.max_slots {
            return Err("slot table full");
        }
        let limit = self.limits.per_writer_rate_limit;
        let window = self.limits.rate_window;
        let quota = self.limits.per_writer_quota;
        let stats = self.writers.get_or_insert_mut(request.from, WriterStats::default);
        if stats.is_rate_limited(now, limit, window) {
            return Err("rate limited");
        }
        if stats.bytes_stored.saturating_add(size) > quota {
            return Err("quota exceeded");
        }
        Ok(expires_at)
    }

    pub fn get(&self, slot: &Slot, version: Option<&VersionKey>) -> Option<Record> {
        self.get_at(slot, version, Instant::now())
    }

    pub fn get_at(&self, slot: &Slot, version: Option<&VersionKey>, now: Instant) -> Option<Record> {
        let chain = self.slots.get(slot)?;
        let stored = match version {
            Some(v) => chain.versions.iter().find(|s| s.record.version == *v)?,
            None => chain.head()?,
        };
        if stored.expires_at <= now {
            return None;
        }
        Some(stored.record.clone())
    }

    pub fn remove(&mut self, request: &RemoveRequest) -> RemoveStatus {
        let slot = request.slot;
        let Some(chain) = self.slots.get(&slot) else {
            return RemoveStatus::NotFound;
        };

        if let Some(owner) = chain.protection
            && let Err(e) = verify_with_domain(
                &owner,
                REMOVE_SIGNATURE_DOMAIN,
                &request.signed_payload(),
                &request.signature,
            )
        {
            debug!(slot = %slot, error = %e, "remove rejected: ownership check failed");
            return RemoveStatus::FailedSecurity;
        }

        let removed: Vec<StoredVersion> = match request.version {
            Some(version) => {
                let Some(chain) = self.slots.get_mut(&slot) else {
                    return RemoveStatus::NotFound;
                };
                let Some(pos) = chain.position(&version) else {
                    return RemoveStatus::NotFound;
                };
                let removed = chain.versions.remove(pos);
                if chain.versions.is_empty() {
                    self.slots.remove(&slot);
                } else if let Some(head) = chain.versions.last() {
                    chain.protection = head.record.protection;
                }
                vec![removed]
            }
            None => match self.slots.remove(&slot) {
                Some(chain) => chain.versions,
                None => return RemoveStatus::NotFound,
            },
        };

        for old in &removed {
            release_bytes(&mut self.writers, &mut self.bytes, old);
        }
        trace!(slot = %slot, removed = removed.len(), "removed versions");
        RemoveStatus::Ok
    }

    pub fn digest(&self, slot: &Slot, range: &DigestRange) -> Digest {
        let entries = self
            .slots
            .get(slot)
            .map(|chain| {
                chain
                    .versions
                    .iter()
                    .filter(|s| range.contains(&s.record.version))
                    .map(|s| DigestEntry {
                        version: s.record.version,
                        based_on: s.record.based_on,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Digest { entries }
    }

    /// Drop expired records. An expired head takes the whole slot with it so
    /// that no chain is left without a head.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut dropped = Vec::new();
        self.slots.retain(|_, chain| {
            let head_expired = chain.head().is_some_and(|h| h.expires_at <= now);
            if head_expired {
                dropped.append(&mut chain.versions);
                return false;
            }
            let (expired, live): (Vec<_>, Vec<_>) =
                chain.versions.drain(..).partition(|v| v.expires_at <= now);
            chain.versions = live;
            dropped.extend(expired);
            !chain.versions.is_empty()
        });
        for old in &dropped {
            release_bytes(&mut self.writers, &mut self.bytes, old);
        }
        dropped.len()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            slots: self.slots.len(),
            versions: self.slots.values().map(|c| c.versions.len()).sum(),
            bytes: self.bytes,
        }
    }
}

fn release_bytes(writers: &mut LruCache<Identity, WriterStats>, bytes: &mut usize, old: &StoredVersion) {
    let size = old.record.payload.len();
    *bytes = bytes.saturating_sub(size);
    if let Some(stats) = writers.get_mut(&old.stored_by) {
        stats.bytes_stored = stats.bytes_stored.saturating_sub(size);
    }
}

fn check_put_ownership(chain: Option<&SlotChain>, request: &PutRequest) -> Result<(), SignatureError> {
    let payload = request.signed_payload();
    match chain.and_then(|c| c.protection) {
        Some(owner) => {
            verify_with_domain(&owner, PUT_SIGNATURE_DOMAIN, &payload, &request.signature)?;
            match request.record.protection {
                Some(key) if key == owner => Ok(()),
                Some(key) if request.change_protection && key.is_valid() => Ok(()),
                None if request.change_protection => Ok(()),
                Some(key) if request.change_protection => {
                    trace!(key = %key.short_hex(), "key change names an invalid key");
                    Err(SignatureError::InvalidPublicKey)
                }
                _ => Err(SignatureError::VerificationFailed),
            }
        }
        // An unowned slot may be claimed only by proving the new key.
        None => match request.record.protection {
            Some(key) => verify_with_domain(&key, PUT_SIGNATURE_DOMAIN, &payload, &request.signature),
            None => Ok(()),
        },
    }
}

fn check_version(chain: Option<&SlotChain>, record: &Record) -> Result<Acceptance, PutStatus> {
    let Some(head) = chain.and_then(|c| c.head()) else {
        return if record.based_on.is_zero() {
            Ok(Acceptance::Append)
        } else {
            Err(PutStatus::VersionConflict)
        };
    };
    let head = &head.record;

    if record.version.is_zero() {
        if !head.version.is_zero() {
            return Err(PutStatus::VersionConflictNoVersionKey);
        }
        return if record.based_on.is_zero() {
            Ok(Acceptance::ReplaceUnversioned)
        } else {
            Err(PutStatus::VersionConflict)
        };
    }

    if head.version == record.version {
        return if head == record {
            Ok(Acceptance::AlreadyHead)
        } else {
            Err(PutStatus::VersionConflict)
        };
    }

    if record.based_on.is_zero() {
        return Err(PutStatus::VersionConflictNoBasedOn);
    }

    if record.based_on == head.version {
        return if record.version.timestamp_ms() < head.version.timestamp_ms() {
            Err(PutStatus::VersionConflictOldTimestamp)
        } else {
            Ok(Acceptance::Append)
        };
    }

    // The writer follows a non-head version: someone else already extended it.
    if let Some(chain) = chain
        && let Some(pos) = chain.position(&record.based_on)
        && let Some(sibling) = chain.versions.get(pos + 1)
        && record.version.timestamp_ms() <= sibling.record.version.timestamp_ms()
    {
        return Err(PutStatus::VersionConflictOldTimestamp);
    }
    Err(PutStatus::VersionConflict)
}

fn prune_history(chain: &mut SlotChain, limits: &StoreLimits, now: Instant) -> Vec<StoredVersion> {
    let max = limits.max_versions.max(1);
    let mut pruned = Vec::new();
    while chain.versions.len() > max {
        let oldest_age = now.saturating_duration_since(chain.versions[0].stored_at);
        if oldest_age < limits.min_prune_age {
            break;
        }
        pruned.push(chain.versions.remove(0));
    }
    pruned
}
