//! # Profile Manager (Single-Writer Queue)
//!
//! Serializes local access to one shared versioned document, the user
//! profile, whose state of record lives in the DHT.
//!
//! ## Roles
//!
//! - **Readers** call `acquire(caller, false)` and get a fresh, consistent
//!   snapshot right away. They never block and are never blocked by a writer.
//! - **Writers** call `acquire(caller, true)` and are queued FIFO behind the
//!   current writer. A writer receives its snapshot only when granted the
//!   role, fetched at that moment, so it always reflects the previous
//!   writer's commit.
//!
//! The writer role ends when the writer commits (successfully or not) or
//! releases. Then the next queued writer is granted. A writer lease is opt-in
//! ([`ProfileConfig::writer_lease`]); without one, a writer is never granted
//! before its predecessor has finished.
//!
//! ## Conflicts
//!
//! If another client wrote the profile in the meantime, `commit` re-fetches
//! the head into the cache and fails with a retryable [`PutFailed`]. The
//! caller's mutation is never re-applied on its behalf.
//!
//! ## Concurrency
//!
//! All queue state lives in one actor task. Network work (fetches, puts) runs
//! in spawned tasks that report back through the actor's command channel, so
//! the actor never waits on the network and readers are served while a
//! commit is in flight.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::client::{GetFailed, StoreClient};
use crate::identity::Keypair;
use crate::messages::{deserialize_bounded, serialize};
use crate::protocols::StorageRpc;
use crate::put::PutFailed;
use crate::record::{Key, Record, Slot, VersionKey};

/// Domain and content names of the profile slot.
const PROFILE_DOMAIN: &str = "profile";
const PROFILE_CONTENT: &str = "profile";

const COMMAND_CHANNEL_CAPACITY: usize = 128;

// ============================================================================
// Profile Document
// ============================================================================

/// Opaque identifier of a local caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(pub u64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    /// Content keys of the file's chunks, in order.
    pub chunks: Vec<Key>,
    pub modified_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub files: BTreeMap<String, FileEntry>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            files: BTreeMap::new(),
        }
    }

    pub fn upsert_file(&mut self, path: impl Into<String>, entry: FileEntry) -> Option<FileEntry> {
        self.files.insert(path.into(), entry)
    }

    pub fn remove_file(&mut self, path: &str) -> Option<FileEntry> {
        self.files.remove(path)
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        deserialize_bounded(bytes)
    }
}

/// A profile together with the version it was read at. `VersionKey::ZERO`
/// means the profile does not exist in the DHT yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub profile: UserProfile,
    pub version: VersionKey,
}

// ============================================================================
// Errors and Configuration
// ============================================================================

#[derive(Debug)]
pub enum ProfileError {
    /// The snapshot could not be fetched.
    Get(GetFailed),
    /// The commit's put was rejected.
    Put(PutFailed),
    /// The caller does not hold the writer role (never had it, or its lease ran out).
    NotWriter(CallerId),
    /// The caller is already the writer or already queued.
    AlreadyQueued(CallerId),
    /// The caller released while its writer request was still queued.
    Released(CallerId),
    /// The stored profile could not be decoded, or the snapshot encoded.
    Encoding(String),
    /// The manager has shut down.
    Stopped,
}

impl ProfileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProfileError::Put(e) => e.is_retryable(),
            ProfileError::Get(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::Get(e) => write!(f, "profile fetch failed: {}", e),
            ProfileError::Put(e) => write!(f, "profile commit failed: {}", e),
            ProfileError::NotWriter(c) => write!(f, "{} is not the registered writer", c),
            ProfileError::AlreadyQueued(c) => write!(f, "{} already holds or awaits the writer role", c),
            ProfileError::Released(c) => write!(f, "{} released before being granted", c),
            ProfileError::Encoding(e) => write!(f, "profile encoding error: {}", e),
            ProfileError::Stopped => write!(f, "profile manager stopped"),
        }
    }
}

impl std::error::Error for ProfileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfileError::Get(e) => Some(e),
            ProfileError::Put(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProfileConfig {
    /// How long a granted writer may hold the role without committing.
    /// `None` lets a writer hold it until it commits or releases.
    pub writer_lease: Option<Duration>,
    /// Treat a missing profile as an error instead of starting from empty.
    pub must_exist: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTelemetry {
    pub cached_version: Option<VersionKey>,
    pub writer: Option<CallerId>,
    pub queued_writers: usize,
    /// Snapshots served to read-only callers.
    pub reads: u64,
    pub commits: u64,
    pub failed_commits: u64,
    pub expired_leases: u64,
}

// ============================================================================
// Handle
// ============================================================================

type SnapshotReply = oneshot::Sender<Result<ProfileSnapshot, ProfileError>>;
type CommitReply = oneshot::Sender<Result<VersionKey, ProfileError>>;

pub struct ProfileManager<N: StorageRpc> {
    cmd_tx: mpsc::Sender<Command>,
    slot: Slot,
    _network: std::marker::PhantomData<fn() -> N>,
}

impl<N: StorageRpc> Clone for ProfileManager<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            slot: self.slot,
            _network: std::marker::PhantomData,
        }
    }
}

enum Command {
    Acquire {
        caller: CallerId,
        write: bool,
        reply: SnapshotReply,
    },
    Commit {
        caller: CallerId,
        snapshot: ProfileSnapshot,
        reply: CommitReply,
    },
    Release {
        caller: CallerId,
        reply: oneshot::Sender<()>,
    },
    ReadFetched {
        caller: CallerId,
        fetched: Result<Option<ProfileSnapshot>, ProfileError>,
        reply: SnapshotReply,
    },
    WriterFetched {
        lease: u64,
        fetched: Result<Option<ProfileSnapshot>, ProfileError>,
        reply: SnapshotReply,
    },
    CommitFinished {
        lease: u64,
        outcome: CommitOutcome,
        reply: CommitReply,
    },
    LeaseExpired {
        lease: u64,
    },
    GetTelemetry(oneshot::Sender<ProfileTelemetry>),
    Quit,
}

impl<N: StorageRpc> ProfileManager<N> {
    /// Start a manager for `user_id`'s profile. Commits are signed with
    /// `keys`, which also become the profile slot's protection key.
    pub fn new(client: StoreClient<N>, keys: Keypair, user_id: &str, config: ProfileConfig) -> Self {
        let slot = Slot::from_names(user_id, PROFILE_DOMAIN, PROFILE_CONTENT);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::new(ProfileStore {
            client,
            keys,
            slot,
            user_id: user_id.to_string(),
            must_exist: config.must_exist,
        });
        let actor = ProfileActor {
            store: shared,
            config,
            cache: None,
            writer: None,
            queue: VecDeque::new(),
            next_lease: 0,
            counters: ProfileTelemetry::default(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            slot,
            _network: std::marker::PhantomData,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Readers get a fresh snapshot immediately. Writers wait for the writer
    /// role and get a snapshot fetched when it is granted.
    pub async fn acquire(&self, caller: CallerId, intend_to_write: bool) -> Result<ProfileSnapshot, ProfileError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Acquire {
                caller,
                write: intend_to_write,
                reply: tx,
            })
            .await
            .map_err(|_| ProfileError::Stopped)?;
        rx.await.map_err(|_| ProfileError::Stopped)?
    }

    /// Persist `snapshot.profile` on top of `snapshot.version`. Only the
    /// registered writer may commit; the role passes on either way.
    pub async fn commit(&self, caller: CallerId, snapshot: ProfileSnapshot) -> Result<VersionKey, ProfileError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Commit {
                caller,
                snapshot,
                reply: tx,
            })
            .await
            .map_err(|_| ProfileError::Stopped)?;
        rx.await.map_err(|_| ProfileError::Stopped)?
    }

    /// Abandon the writer role or withdraw a queued writer request. Read-only
    /// callers hold nothing, so for them this is a no-op.
    pub async fn release(&self, caller: CallerId) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Release { caller, reply: tx }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Acquire for write, apply `mutate`, commit.
    pub async fn update<F>(&self, caller: CallerId, mutate: F) -> Result<VersionKey, ProfileError>
    where
        F: FnOnce(&mut UserProfile),
    {
        let mut snapshot = self.acquire(caller, true).await?;
        mutate(&mut snapshot.profile);
        self.commit(caller, snapshot).await
    }

    pub async fn telemetry(&self) -> ProfileTelemetry {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTelemetry(tx)).await.is_err() {
            return ProfileTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Network Side
// ============================================================================

/// The parts of the manager that spawned tasks need.
struct ProfileStore<N: StorageRpc> {
    client: StoreClient<N>,
    keys: Keypair,
    slot: Slot,
    user_id: String,
    must_exist: bool,
}

struct CommitOutcome {
    result: Result<ProfileSnapshot, ProfileError>,
    /// Head fetched after a conflicting commit.
    refreshed: Option<ProfileSnapshot>,
}

impl<N: StorageRpc> ProfileStore<N> {
    /// The current head, or `None` when replicas report no profile yet.
    /// Unreachable replicas are an error, never an empty profile.
    async fn fetch(&self) -> Result<Option<ProfileSnapshot>, ProfileError> {
        match self.client.get_required(self.slot, None).await {
            Ok(record) => decode(&record).map(Some),
            Err(e) if e.is_absent() && !self.must_exist => Ok(None),
            Err(e) => Err(ProfileError::Get(e)),
        }
    }

    async fn commit(&self, snapshot: ProfileSnapshot) -> CommitOutcome {
        let payload = match snapshot.profile.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                return CommitOutcome {
                    result: Err(ProfileError::Encoding(e.to_string())),
                    refreshed: None,
                };
            }
        };
        let record = Record::successor(snapshot.version, payload)
            .with_ttl(self.client.config().record_ttl_secs)
            .protected_by(self.keys.identity());

        match self.client.put(self.slot, record, Some(&self.keys)).await {
            Ok(version) => CommitOutcome {
                result: Ok(ProfileSnapshot {
                    profile: snapshot.profile,
                    version,
                }),
                refreshed: None,
            },
            Err(failed) => {
                let refreshed = if failed.is_retryable() {
                    match self.fetch().await {
                        Ok(head) => head,
                        Err(e) => {
                            warn!(slot = %self.slot, error = %e, "re-fetch after failed commit failed");
                            None
                        }
                    }
                } else {
                    None
                };
                CommitOutcome {
                    result: Err(ProfileError::Put(failed)),
                    refreshed,
                }
            }
        }
    }
}

fn decode(record: &Record) -> Result<ProfileSnapshot, ProfileError> {
    let profile = UserProfile::from_bytes(&record.payload).map_err(|e| ProfileError::Encoding(e.to_string()))?;
    Ok(ProfileSnapshot {
        profile,
        version: record.version,
    })
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterPhase {
    Fetching,
    Granted,
    Committing,
}

struct ActiveWriter {
    caller: CallerId,
    lease: u64,
    phase: WriterPhase,
}

struct QueuedWriter {
    caller: CallerId,
    reply: SnapshotReply,
}

struct ProfileActor<N: StorageRpc> {
    store: Arc<ProfileStore<N>>,
    config: ProfileConfig,
    cache: Option<ProfileSnapshot>,
    writer: Option<ActiveWriter>,
    queue: VecDeque<QueuedWriter>,
    next_lease: u64,
    counters: ProfileTelemetry,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
}

impl<N: StorageRpc> ProfileActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Acquire { caller, write: false, reply } => {
                    self.spawn_fetch(move |fetched| Command::ReadFetched { caller, fetched, reply });
                }
                Command::Acquire { caller, write: true, reply } => {
                    self.handle_writer_request(caller, reply);
                }
                Command::Commit { caller, snapshot, reply } => {
                    self.handle_commit(caller, snapshot, reply);
                }
                Command::Release { caller, reply } => {
                    self.handle_release(caller);
                    let _ = reply.send(());
                }
                Command::ReadFetched { caller, fetched, reply } => {
                    let result = fetched.map(|head| self.absorb(head));
                    match &result {
                        Ok(_) => self.counters.reads += 1,
                        Err(e) => debug!(caller = %caller, error = %e, "read snapshot fetch failed"),
                    }
                    let _ = reply.send(result);
                }
                Command::WriterFetched { lease, fetched, reply } => {
                    self.handle_writer_fetched(lease, fetched, reply);
                }
                Command::CommitFinished { lease, outcome, reply } => {
                    self.handle_commit_finished(lease, outcome, reply);
                }
                Command::LeaseExpired { lease } => {
                    self.handle_lease_expired(lease);
                }
                Command::GetTelemetry(reply) => {
                    let snapshot = ProfileTelemetry {
                        cached_version: self.cache.as_ref().map(|c| c.version),
                        writer: self.writer.as_ref().map(|w| w.caller),
                        queued_writers: self.queue.len(),
                        ..self.counters.clone()
                    };
                    let _ = reply.send(snapshot);
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }

    fn spawn_fetch<F>(&self, finish: F)
    where
        F: FnOnce(Result<Option<ProfileSnapshot>, ProfileError>) -> Command + Send + 'static,
    {
        let store = self.store.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let fetched = store.fetch().await;
            let _ = cmd_tx.send(finish(fetched)).await;
        });
    }

    /// Merge a fetched head into the cache and return the best-known snapshot.
    fn absorb(&mut self, fetched: Option<ProfileSnapshot>) -> ProfileSnapshot {
        if let Some(head) = fetched
            && self.cache.as_ref().is_none_or(|c| head.version >= c.version)
        {
            self.cache = Some(head);
        }
        match &self.cache {
            Some(cached) => cached.clone(),
            None => ProfileSnapshot {
                profile: UserProfile::new(self.store.user_id.clone()),
                version: VersionKey::ZERO,
            },
        }
    }

    fn handle_writer_request(&mut self, caller: CallerId, reply: SnapshotReply) {
        let is_writer = self.writer.as_ref().is_some_and(|w| w.caller == caller);
        if is_writer || self.queue.iter().any(|q| q.caller == caller) {
            let _ = reply.send(Err(ProfileError::AlreadyQueued(caller)));
            return;
        }
        self.queue.push_back(QueuedWriter { caller, reply });
        debug!(caller = %caller, queued = self.queue.len(), "writer queued");
        self.grant_next();
    }

    fn grant_next(&mut self) {
        while self.writer.is_none() {
            let Some(next) = self.queue.pop_front() else {
                return;
            };
            if next.reply.is_closed() {
                debug!(caller = %next.caller, "skipping abandoned writer request");
                continue;
            }
            let lease = self.next_lease;
            self.next_lease += 1;
            self.writer = Some(ActiveWriter {
                caller: next.caller,
                lease,
                phase: WriterPhase::Fetching,
            });
            debug!(caller = %next.caller, lease, "granting writer role");
            let reply = next.reply;
            self.spawn_fetch(move |fetched| Command::WriterFetched { lease, fetched, reply });
        }
    }

    fn current_lease(&self, lease: u64) -> bool {
        self.writer.as_ref().is_some_and(|w| w.lease == lease)
    }

    fn handle_writer_fetched(
        &mut self,
        lease: u64,
        fetched: Result<Option<ProfileSnapshot>, ProfileError>,
        reply: SnapshotReply,
    ) {
        if !self.current_lease(lease) {
            return;
        }
        let snapshot = match fetched {
            Ok(head) => self.absorb(head),
            Err(e) => {
                warn!(lease, error = %e, "writer snapshot fetch failed");
                let _ = reply.send(Err(e));
                self.writer = None;
                self.grant_next();
                return;
            }
        };
        if reply.send(Ok(snapshot)).is_err() {
            debug!(lease, "writer went away before its grant");
            self.writer = None;
            self.grant_next();
            return;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.phase = WriterPhase::Granted;
        }

        if let Some(duration) = self.config.writer_lease {
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                sleep(duration).await;
                let _ = cmd_tx.send(Command::LeaseExpired { lease }).await;
            });
        }
    }

    fn handle_commit(&mut self, caller: CallerId, snapshot: ProfileSnapshot, reply: CommitReply) {
        let lease = match self.writer.as_mut() {
            Some(w) if w.caller == caller && w.phase == WriterPhase::Granted => {
                w.phase = WriterPhase::Committing;
                w.lease
            }
            _ => {
                let _ = reply.send(Err(ProfileError::NotWriter(caller)));
                return;
            }
        };
        debug!(caller = %caller, based_on = %snapshot.version, "committing profile");

        let store = self.store.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let outcome = store.commit(snapshot).await;
            let _ = cmd_tx.send(Command::CommitFinished { lease, outcome, reply }).await;
        });
    }

    fn handle_commit_finished(&mut self, lease: u64, outcome: CommitOutcome, reply: CommitReply) {
        let result = match outcome.result {
            Ok(committed) => {
                self.counters.commits += 1;
                let version = committed.version;
                info!(version = %version, "profile committed");
                self.absorb(Some(committed));
                Ok(version)
            }
            Err(e) => {
                self.counters.failed_commits += 1;
                if let Some(head) = outcome.refreshed {
                    info!(head = %head.version, "profile head refreshed after failed commit");
                    self.cache = Some(head);
                }
                Err(e)
            }
        };
        let _ = reply.send(result);
        if self.current_lease(lease) {
            self.writer = None;
        }
        self.grant_next();
    }

    fn handle_lease_expired(&mut self, lease: u64) {
        let expired = self
            .writer
            .as_ref()
            .is_some_and(|w| w.lease == lease && w.phase == WriterPhase::Granted);
        if !expired {
            return;
        }
        if let Some(writer) = self.writer.take() {
            warn!(caller = %writer.caller, lease, "writer lease expired");
        }
        self.counters.expired_leases += 1;
        self.grant_next();
    }

    fn handle_release(&mut self, caller: CallerId) {
        let (withdrawn, kept): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|q| q.caller == caller);
        self.queue = kept;
        for request in withdrawn {
            let _ = request.reply.send(Err(ProfileError::Released(caller)));
        }

        let releasing_writer = self
            .writer
            .as_ref()
            .is_some_and(|w| w.caller == caller && w.phase != WriterPhase::Committing);
        if releasing_writer {
            debug!(caller = %caller, "writer released without committing");
            self.writer = None;
            self.grant_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::swarm::LocalSwarm;
    use tokio::time::timeout;

    fn manager(swarm: &LocalSwarm, keys: &Keypair, config: ProfileConfig) -> ProfileManager<LocalSwarm> {
        let client_config = ClientConfig {
            retry_backoff: Duration::from_millis(1),
            ..ClientConfig::default()
        };
        let client = StoreClient::new(swarm.clone(), Keypair::generate().identity(), client_config);
        ProfileManager::new(client, keys.clone(), "alice", config)
    }

    fn entry(size: u64) -> FileEntry {
        FileEntry {
            size,
            chunks: vec![[size as u8; 32]],
            modified_ms: size,
        }
    }

    async fn wait_for<F>(profiles: &ProfileManager<LocalSwarm>, condition: F)
    where
        F: Fn(&ProfileTelemetry) -> bool,
    {
        for _ in 0..200 {
            if condition(&profiles.telemetry().await) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn reader_sees_empty_profile_before_first_commit() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());
        let snapshot = profiles.acquire(CallerId(1), false).await.unwrap();
        assert_eq!(snapshot.version, VersionKey::ZERO);
        assert_eq!(snapshot.profile, UserProfile::new("alice"));
    }

    #[tokio::test]
    async fn must_exist_turns_absence_into_get_failed() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let config = ProfileConfig {
            must_exist: true,
            ..ProfileConfig::default()
        };
        let profiles = manager(&swarm, &Keypair::generate(), config);
        let err = profiles.acquire(CallerId(1), false).await.unwrap_err();
        assert!(matches!(err, ProfileError::Get(_)));
    }

    #[tokio::test]
    async fn committed_profile_is_visible_to_readers() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let version = profiles
            .update(CallerId(1), |p| {
                p.upsert_file("notes.txt", entry(10));
            })
            .await
            .unwrap();

        let snapshot = profiles.acquire(CallerId(2), false).await.unwrap();
        assert_eq!(snapshot.version, version);
        assert_eq!(snapshot.profile.file("notes.txt"), Some(&entry(10)));
        let telemetry = profiles.telemetry().await;
        assert_eq!(telemetry.commits, 1);
        assert_eq!(telemetry.reads, 1);
    }

    #[tokio::test]
    async fn second_writer_blocks_until_first_commits() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let mut first = profiles.acquire(CallerId(1), true).await.unwrap();

        let second = {
            let profiles = profiles.clone();
            tokio::spawn(async move { profiles.acquire(CallerId(2), true).await })
        };
        wait_for(&profiles, |t| t.queued_writers == 1).await;

        // Readers are not blocked by the writer.
        assert!(profiles.acquire(CallerId(3), false).await.is_ok());
        assert!(!second.is_finished());

        first.profile.upsert_file("a.txt", entry(1));
        let v1 = profiles.commit(CallerId(1), first).await.unwrap();

        let granted = timeout(Duration::from_secs(5), second).await.unwrap().unwrap().unwrap();
        assert_eq!(granted.version, v1);
        assert_eq!(granted.profile.file("a.txt"), Some(&entry(1)));
    }

    #[tokio::test]
    async fn writers_are_served_in_registration_order() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let w1 = profiles.acquire(CallerId(1), true).await.unwrap();
        let mut handles = Vec::new();
        for (i, id) in [2u64, 3].into_iter().enumerate() {
            let p = profiles.clone();
            handles.push(tokio::spawn(async move {
                let mut snapshot = p.acquire(CallerId(id), true).await?;
                let based_on = snapshot.version;
                snapshot.profile.upsert_file(format!("w{id}"), entry(id));
                let version = p.commit(CallerId(id), snapshot).await?;
                Ok::<_, ProfileError>((based_on, version))
            }));
            wait_for(&profiles, |t| t.queued_writers == i + 1).await;
        }

        let mut w1 = w1;
        w1.profile.upsert_file("w1", entry(1));
        let v1 = profiles.commit(CallerId(1), w1).await.unwrap();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        let (w2_base, v2) = results[0];
        let (w3_base, v3) = results[1];
        assert_eq!(w2_base, v1);
        assert_eq!(w3_base, v2);

        let last = profiles.acquire(CallerId(9), false).await.unwrap();
        assert_eq!(last.version, v3);
        assert_eq!(last.profile.files.len(), 3);
    }

    #[tokio::test]
    async fn only_the_registered_writer_may_commit() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let reader = profiles.acquire(CallerId(1), false).await.unwrap();
        let err = profiles.commit(CallerId(1), reader).await.unwrap_err();
        assert!(matches!(err, ProfileError::NotWriter(CallerId(1))));

        let _writer = profiles.acquire(CallerId(2), true).await.unwrap();
        let err = profiles.acquire(CallerId(2), true).await.unwrap_err();
        assert!(matches!(err, ProfileError::AlreadyQueued(CallerId(2))));
    }

    #[tokio::test]
    async fn release_hands_the_role_to_the_next_writer() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let _abandoned = profiles.acquire(CallerId(1), true).await.unwrap();
        let next = {
            let p = profiles.clone();
            tokio::spawn(async move { p.acquire(CallerId(2), true).await })
        };
        wait_for(&profiles, |t| t.queued_writers == 1).await;

        profiles.release(CallerId(1)).await;
        let granted = timeout(Duration::from_secs(5), next).await.unwrap().unwrap().unwrap();
        assert_eq!(granted.version, VersionKey::ZERO);
        assert_eq!(profiles.telemetry().await.writer, Some(CallerId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_revokes_the_writer_role() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let config = ProfileConfig {
            writer_lease: Some(Duration::from_secs(5)),
            ..ProfileConfig::default()
        };
        let profiles = manager(&swarm, &Keypair::generate(), config);

        let stale = profiles.acquire(CallerId(1), true).await.unwrap();
        let next = {
            let p = profiles.clone();
            tokio::spawn(async move { p.acquire(CallerId(2), true).await })
        };

        sleep(Duration::from_secs(6)).await;
        let granted = next.await.unwrap().unwrap();
        assert_eq!(granted.version, VersionKey::ZERO);

        let err = profiles.commit(CallerId(1), stale).await.unwrap_err();
        assert!(matches!(err, ProfileError::NotWriter(CallerId(1))));

        let telemetry = profiles.telemetry().await;
        assert_eq!(telemetry.expired_leases, 1);
        assert_eq!(telemetry.writer, Some(CallerId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn writer_without_lease_keeps_the_role_until_it_commits() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let profiles = manager(&swarm, &Keypair::generate(), ProfileConfig::default());

        let mut slow = profiles.acquire(CallerId(1), true).await.unwrap();
        let next = {
            let p = profiles.clone();
            tokio::spawn(async move { p.acquire(CallerId(2), true).await })
        };

        sleep(Duration::from_secs(10 * 60)).await;
        assert!(!next.is_finished());
        assert_eq!(profiles.telemetry().await.writer, Some(CallerId(1)));

        slow.profile.upsert_file("late.txt", entry(7));
        let v1 = profiles.commit(CallerId(1), slow).await.unwrap();
        let granted = next.await.unwrap().unwrap();
        assert_eq!(granted.version, v1);
        assert_eq!(profiles.telemetry().await.expired_leases, 0);
    }

    #[tokio::test]
    async fn unreachable_dht_fails_the_grant_instead_of_starting_empty() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let keys = Keypair::generate();
        let first = manager(&swarm, &keys, ProfileConfig::default());
        first
            .update(CallerId(1), |p| {
                p.upsert_file("kept.txt", entry(1));
            })
            .await
            .unwrap();

        let fresh = manager(&swarm, &keys, ProfileConfig::default());
        swarm.set_transport_down(true).await;
        let err = fresh.acquire(CallerId(1), true).await.unwrap_err();
        assert!(matches!(&err, ProfileError::Get(e) if !e.is_absent()));
        assert!(err.is_retryable());
        assert!(matches!(fresh.acquire(CallerId(2), false).await, Err(ProfileError::Get(_))));
        assert_eq!(fresh.telemetry().await.writer, None);

        swarm.set_transport_down(false).await;
        let snapshot = fresh.acquire(CallerId(1), true).await.unwrap();
        assert!(snapshot.profile.file("kept.txt").is_some());
    }

    #[tokio::test]
    async fn foreign_write_fails_commit_and_refreshes_cache() {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let keys = Keypair::generate();
        let profiles = manager(&swarm, &keys, ProfileConfig::default());
        let v1 = profiles
            .update(CallerId(1), |p| {
                p.upsert_file("a.txt", entry(1));
            })
            .await
            .unwrap();

        let mut stale = profiles.acquire(CallerId(2), true).await.unwrap();
        assert_eq!(stale.version, v1);

        // Another device of the same user writes a newer version directly.
        let other = StoreClient::new(swarm.clone(), Keypair::generate().identity(), ClientConfig::default());
        let mut foreign = stale.profile.clone();
        foreign.upsert_file("b.txt", entry(2));
        let newer = VersionKey::derive_at(v1.timestamp_ms() + 60_000, &v1, b"foreign");
        let record = Record {
            version: newer,
            based_on: v1,
            payload: foreign.to_bytes().unwrap(),
            ttl_secs: 3600,
            protection: Some(keys.identity()),
        };
        other.put(profiles.slot(), record, Some(&keys)).await.unwrap();

        stale.profile.upsert_file("c.txt", entry(3));
        let err = profiles.commit(CallerId(2), stale).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(&err, ProfileError::Put(e) if e.is_conflict()));

        let telemetry = profiles.telemetry().await;
        assert_eq!(telemetry.cached_version, Some(newer));
        assert_eq!(telemetry.writer, None);

        let fresh = profiles.acquire(CallerId(3), false).await.unwrap();
        assert_eq!(fresh.version, newer);
        assert!(fresh.profile.file("b.txt").is_some());
        assert!(fresh.profile.file("c.txt").is_none());
    }
}
