//! # In-Process Replica Swarm
//!
//! [`LocalSwarm`] implements [`StorageRpc`] over a fixed set of
//! [`ReplicaNode`] actors living in the same process. It stands in for the DHT
//! substrate in tests and in the demo binary.
//!
//! ## Replica Selection
//!
//! The replicas responsible for a slot are the `replication_factor` replicas
//! whose identity is closest (XOR metric) to the slot's location key.
//!
//! ## Wire Boundary
//!
//! Every request and reply is bincode-encoded and decoded with
//! [`deserialize_bounded`] on its way to and from a replica, so values that
//! would not survive the wire do not survive here either.
//!
//! ## Fault Injection
//!
//! | Fault | Effect |
//! |-------|--------|
//! | unreachable replica | no reply from that replica |
//! | rejecting replica | puts answered with `Failed`, nothing stored |
//! | latency | reply delayed (subject to the call timeout) |
//! | transport down | every call returns `Err` |

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace};

use crate::identity::{Identity, Keypair};
use crate::messages::{
    deserialize_bounded, serialize, PutRequest, PutStatus, RemoveRequest, RemoveStatus, ReplicaReplies,
    StorageRequest, StorageResponse,
};
use crate::protocols::StorageRpc;
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey};
use crate::replica::{ReplicaNode, ReplicaTelemetry};
use crate::storage::StoreLimits;

/// Default number of replicas holding each slot.
pub const DEFAULT_REPLICATION_FACTOR: usize = 5;

/// Default number of replicas in a swarm.
pub const DEFAULT_SWARM_SIZE: usize = 8;

/// Per-replica call timeout; slower replicas count as silent.
pub const REPLICA_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SwarmConfig {
    pub replicas: usize,
    pub replication_factor: usize,
    pub call_timeout: Duration,
    pub limits: StoreLimits,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_SWARM_SIZE,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            call_timeout: REPLICA_CALL_TIMEOUT,
            limits: StoreLimits::default(),
        }
    }
}

/// Number of substrate calls made through the swarm, per operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwarmCalls {
    pub puts: u64,
    pub gets: u64,
    pub removes: u64,
    pub digests: u64,
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<Identity>,
    rejecting: HashSet<Identity>,
    latencies: HashMap<Identity, Duration>,
    transport_down: bool,
}

#[derive(Default)]
struct CallCounters {
    puts: AtomicU64,
    gets: AtomicU64,
    removes: AtomicU64,
    digests: AtomicU64,
}

struct SwarmInner {
    replicas: Vec<ReplicaNode>,
    config: SwarmConfig,
    faults: Mutex<Faults>,
    calls: CallCounters,
}

/// Cloneable handle to a set of in-process replicas.
#[derive(Clone)]
pub struct LocalSwarm {
    inner: Arc<SwarmInner>,
}

impl LocalSwarm {
    /// Spawn `config.replicas` replica actors. Must be called from within a
    /// Tokio runtime.
    pub fn new(config: SwarmConfig) -> Self {
        let replicas = (0..config.replicas.max(1))
            .map(|_| ReplicaNode::new(Keypair::generate().identity(), config.limits.clone()))
            .collect();
        Self {
            inner: Arc::new(SwarmInner {
                replicas,
                config,
                faults: Mutex::new(Faults::default()),
                calls: CallCounters::default(),
            }),
        }
    }

    pub fn with_replicas(replicas: usize, replication_factor: usize) -> Self {
        Self::new(SwarmConfig {
            replicas,
            replication_factor,
            ..SwarmConfig::default()
        })
    }

    pub fn replica_ids(&self) -> Vec<Identity> {
        self.inner.replicas.iter().map(|r| r.identity()).collect()
    }

    pub fn replica(&self, id: &Identity) -> Option<ReplicaNode> {
        self.inner.replicas.iter().find(|r| r.identity() == *id).cloned()
    }

    /// Identities of the replicas responsible for `slot`, closest first.
    pub fn responsible_for(&self, slot: &Slot) -> Vec<Identity> {
        self.responsible(slot).iter().map(|r| r.identity()).collect()
    }

    fn responsible(&self, slot: &Slot) -> Vec<ReplicaNode> {
        let mut replicas = self.inner.replicas.clone();
        replicas.sort_by_key(|r| r.identity().xor_distance(&slot.location));
        replicas.truncate(self.inner.config.replication_factor.max(1));
        replicas
    }

    pub async fn set_unreachable(&self, replica: Identity, unreachable: bool) {
        let mut faults = self.inner.faults.lock().await;
        if unreachable {
            faults.unreachable.insert(replica);
        } else {
            faults.unreachable.remove(&replica);
        }
    }

    pub async fn set_rejecting(&self, replica: Identity, rejecting: bool) {
        let mut faults = self.inner.faults.lock().await;
        if rejecting {
            faults.rejecting.insert(replica);
        } else {
            faults.rejecting.remove(&replica);
        }
    }

    pub async fn set_latency(&self, replica: Identity, latency: Duration) {
        self.inner.faults.lock().await.latencies.insert(replica, latency);
    }

    pub async fn set_transport_down(&self, down: bool) {
        self.inner.faults.lock().await.transport_down = down;
    }

    /// Clear every injected fault.
    pub async fn heal(&self) {
        *self.inner.faults.lock().await = Faults::default();
    }

    pub fn calls(&self) -> SwarmCalls {
        let c = &self.inner.calls;
        SwarmCalls {
            puts: c.puts.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            digests: c.digests.load(Ordering::Relaxed),
        }
    }

    pub fn reset_calls(&self) {
        let c = &self.inner.calls;
        c.puts.store(0, Ordering::Relaxed);
        c.gets.store(0, Ordering::Relaxed);
        c.removes.store(0, Ordering::Relaxed);
        c.digests.store(0, Ordering::Relaxed);
    }

    /// Deliver a put to the listed replicas only, ignoring injected faults.
    /// Used to stage divergent replica states.
    pub async fn put_to(&self, replicas: &[Identity], request: PutRequest) -> ReplicaReplies<PutStatus> {
        let mut out = Vec::with_capacity(replicas.len());
        for id in replicas {
            let Some(replica) = self.replica(id) else {
                continue;
            };
            match replica.put(request.clone()).await {
                Ok(status) => out.push((*id, status)),
                Err(e) => debug!(replica = %id.short_hex(), error = %e, "staged put failed"),
            }
        }
        out
    }

    pub async fn telemetry(&self) -> Vec<(Identity, ReplicaTelemetry)> {
        let mut out = Vec::with_capacity(self.inner.replicas.len());
        for replica in &self.inner.replicas {
            out.push((replica.identity(), replica.telemetry().await));
        }
        out
    }

    pub async fn quit(&self) {
        for replica in &self.inner.replicas {
            replica.quit().await;
        }
    }

    async fn fan_out<T>(
        &self,
        targets: Vec<ReplicaNode>,
        request: StorageRequest,
        extract: fn(StorageResponse) -> Option<T>,
    ) -> Result<ReplicaReplies<T>> {
        if self.inner.faults.lock().await.transport_down {
            return Err(anyhow!("injected transport failure"));
        }

        let mut join_set = JoinSet::new();
        for replica in targets {
            let inner = self.inner.clone();
            let request = request.clone();
            join_set.spawn(async move {
                let id = replica.identity();
                let result = timeout(inner.config.call_timeout, inner.deliver(&replica, request)).await;
                (id, result)
            });
        }

        let mut replies = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((id, result)) = joined else {
                continue;
            };
            match result {
                Ok(Ok(response)) => match extract(response) {
                    Some(value) => replies.push((id, value)),
                    None => debug!(replica = %id.short_hex(), "replica sent a mismatched reply"),
                },
                Ok(Err(e)) => trace!(replica = %id.short_hex(), error = %e, "replica did not answer"),
                Err(_) => debug!(replica = %id.short_hex(), "replica call timed out"),
            }
        }
        Ok(replies)
    }
}

impl SwarmInner {
    async fn deliver(&self, replica: &ReplicaNode, request: StorageRequest) -> Result<StorageResponse> {
        let id = replica.identity();
        let (unreachable, rejecting, latency) = {
            let faults = self.faults.lock().await;
            (
                faults.unreachable.contains(&id),
                faults.rejecting.contains(&id),
                faults.latencies.get(&id).copied(),
            )
        };
        if unreachable {
            return Err(anyhow!("injected network failure"));
        }
        if let Some(delay) = latency {
            sleep(delay).await;
        }
        if rejecting && matches!(request, StorageRequest::Put(_)) {
            return Ok(StorageResponse::Put(PutStatus::Failed));
        }

        let bytes = serialize(&request)?;
        let decoded: StorageRequest = deserialize_bounded(&bytes)?;
        let response = replica.handle(decoded).await?;
        let bytes = serialize(&response)?;
        Ok(deserialize_bounded(&bytes)?)
    }
}

#[async_trait]
impl StorageRpc for LocalSwarm {
    async fn put(&self, request: PutRequest) -> Result<ReplicaReplies<PutStatus>> {
        self.inner.calls.puts.fetch_add(1, Ordering::Relaxed);
        let targets = self.responsible(&request.slot);
        self.fan_out(targets, StorageRequest::Put(request), |r| match r {
            StorageResponse::Put(status) => Some(status),
            _ => None,
        })
        .await
    }

    async fn get(&self, slot: Slot, version: Option<VersionKey>) -> Result<ReplicaReplies<Option<Record>>> {
        self.inner.calls.gets.fetch_add(1, Ordering::Relaxed);
        let targets = self.responsible(&slot);
        self.fan_out(targets, StorageRequest::Get { slot, version }, |r| match r {
            StorageResponse::Value(record) => Some(record),
            _ => None,
        })
        .await
    }

    async fn remove(&self, request: RemoveRequest) -> Result<ReplicaReplies<RemoveStatus>> {
        self.inner.calls.removes.fetch_add(1, Ordering::Relaxed);
        let targets = self.responsible(&request.slot);
        self.fan_out(targets, StorageRequest::Remove(request), |r| match r {
            StorageResponse::Remove(status) => Some(status),
            _ => None,
        })
        .await
    }

    async fn digest(
        &self,
        slot: Slot,
        range: DigestRange,
        replicas: Option<&[Identity]>,
    ) -> Result<ReplicaReplies<Digest>> {
        self.inner.calls.digests.fetch_add(1, Ordering::Relaxed);
        let targets = match replicas {
            Some(ids) => self
                .inner
                .replicas
                .iter()
                .filter(|r| ids.contains(&r.identity()))
                .cloned()
                .collect(),
            None => self.responsible(&slot),
        };
        self.fan_out(targets, StorageRequest::Digest { slot, range }, |r| match r {
            StorageResponse::Digest(digest) => Some(digest),
            _ => None,
        })
        .await
    }
}
