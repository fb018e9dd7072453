//! # Replica Actor
//!
//! A replica owns one [`VersionedStore`] and serializes every request against
//! it through a single actor task. Callers hold a cheap, cloneable
//! [`ReplicaNode`] handle and talk to the actor over an `mpsc` channel; each
//! command carries a `oneshot` sender for its reply.
//!
//! A background task sweeps expired records every [`EXPIRY_SWEEP_INTERVAL`].

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::identity::Identity;
use crate::messages::{PutRequest, PutStatus, RemoveRequest, RemoveStatus, StorageRequest, StorageResponse};
use crate::record::{Digest, DigestRange, Record, Slot, VersionKey};
use crate::storage::{StoreLimits, StoreStats, VersionedStore};

/// Interval between TTL expiry sweeps.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of a replica's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaTelemetry {
    pub stored_slots: usize,
    pub stored_versions: usize,
    pub stored_bytes: usize,
    pub puts_accepted: u64,
    pub puts_rejected: u64,
    pub gets: u64,
    pub removes: u64,
    pub expired: u64,
}

#[derive(Clone)]
pub struct ReplicaNode {
    cmd_tx: mpsc::Sender<Command>,
    id: Identity,
}

struct ReplicaActor {
    store: VersionedStore,
    counters: ReplicaTelemetry,
    cmd_rx: mpsc::Receiver<Command>,
    id: Identity,
}

enum Command {
    Handle(StorageRequest, oneshot::Sender<StorageResponse>),
    GetTelemetry(oneshot::Sender<ReplicaTelemetry>),
    Expire(Instant),
    Quit,
}

impl ReplicaNode {
    pub fn new(id: Identity, limits: StoreLimits) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = ReplicaActor {
            store: VersionedStore::new(limits),
            counters: ReplicaTelemetry::default(),
            cmd_rx,
            id,
        };
        tokio::spawn(actor.run());

        let node = Self { cmd_tx, id };
        node.spawn_periodic_expiry();
        node
    }

    pub fn identity(&self) -> Identity {
        self.id
    }

    fn spawn_periodic_expiry(&self) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if cmd_tx.send(Command::Expire(Instant::now())).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Run one request against the local store.
    pub async fn handle(&self, request: StorageRequest) -> Result<StorageResponse> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Handle(request, tx))
            .await
            .map_err(|_| anyhow!("replica {} stopped", self.id.short_hex()))?;
        rx.await
            .map_err(|_| anyhow!("replica {} dropped the request", self.id.short_hex()))
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutStatus> {
        match self.handle(StorageRequest::Put(request)).await? {
            StorageResponse::Put(status) => Ok(status),
            other => Err(unexpected("put", other)),
        }
    }

    pub async fn get(&self, slot: Slot, version: Option<VersionKey>) -> Result<Option<Record>> {
        match self.handle(StorageRequest::Get { slot, version }).await? {
            StorageResponse::Value(record) => Ok(record),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn remove(&self, request: RemoveRequest) -> Result<RemoveStatus> {
        match self.handle(StorageRequest::Remove(request)).await? {
            StorageResponse::Remove(status) => Ok(status),
            other => Err(unexpected("remove", other)),
        }
    }

    pub async fn digest(&self, slot: Slot, range: DigestRange) -> Result<Digest> {
        match self.handle(StorageRequest::Digest { slot, range }).await? {
            StorageResponse::Digest(digest) => Ok(digest),
            other => Err(unexpected("digest", other)),
        }
    }

    pub async fn telemetry(&self) -> ReplicaTelemetry {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTelemetry(tx)).await.is_err() {
            return ReplicaTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

fn unexpected(op: &str, response: StorageResponse) -> anyhow::Error {
    match response {
        StorageResponse::Error { message } => anyhow!("{op} failed at replica: {message}"),
        other => anyhow!("unexpected reply to {op}: {other:?}"),
    }
}

impl ReplicaActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Handle(request, reply) => {
                    let response = self.handle_request(request);
                    let _ = reply.send(response);
                }
                Command::GetTelemetry(reply) => {
                    let StoreStats { slots, versions, bytes } = self.store.stats();
                    let snapshot = ReplicaTelemetry {
                        stored_slots: slots,
                        stored_versions: versions,
                        stored_bytes: bytes,
                        ..self.counters.clone()
                    };
                    let _ = reply.send(snapshot);
                }
                Command::Expire(now) => {
                    let expired = self.store.expire(now);
                    if expired > 0 {
                        self.counters.expired += expired as u64;
                        debug!(replica = %self.id.short_hex(), expired, "expired records");
                    }
                }
                Command::Quit => {
                    break;
                }
            }
        }
        trace!(replica = %self.id.short_hex(), "replica actor stopped");
    }

    fn handle_request(&mut self, request: StorageRequest) -> StorageResponse {
        match request {
            StorageRequest::Put(put) => {
                let status = self.store.put(&put);
                if status.is_ok() {
                    self.counters.puts_accepted += 1;
                } else {
                    self.counters.puts_rejected += 1;
                }
                StorageResponse::Put(status)
            }
            StorageRequest::Get { slot, version } => {
                self.counters.gets += 1;
                StorageResponse::Value(self.store.get(&slot, version.as_ref()))
            }
            StorageRequest::Remove(remove) => {
                self.counters.removes += 1;
                StorageResponse::Remove(self.store.remove(&remove))
            }
            StorageRequest::Digest { slot, range } => StorageResponse::Digest(self.store.digest(&slot, &range)),
        }
    }
}
