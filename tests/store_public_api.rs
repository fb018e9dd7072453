//! Integration tests for the StoreClient public API.
//!
//! These tests drive the put, get and remove protocols against an in-process
//! replica swarm, covering racing writers, ownership enforcement, fault
//! tolerance and retry bounds.

use std::time::Duration;

use tessera::{
    ClientConfig, DigestRange, Keypair, LocalSwarm, PutFailure, PutOptions, PutStatus, Record, RemoveFailure, Slot,
    StorageRpc, StoreClient, VersionKey, DEFAULT_MAX_ATTEMPTS,
};

const REPLICAS: usize = 5;

fn config() -> ClientConfig {
    ClientConfig {
        retry_backoff: Duration::from_millis(2),
        ..ClientConfig::default()
    }
}

fn client(swarm: &LocalSwarm) -> StoreClient<LocalSwarm> {
    StoreClient::new(swarm.clone(), Keypair::generate().identity(), config())
}

/// Record with an explicit timestamp, protected by `owner`.
fn record_at(timestamp_ms: u64, based_on: VersionKey, payload: &[u8], owner: &Keypair) -> Record {
    Record {
        version: VersionKey::derive_at(timestamp_ms, &based_on, payload),
        based_on,
        payload: payload.to_vec(),
        ttl_secs: 3600,
        protection: Some(owner.identity()),
    }
}

#[tokio::test]
async fn first_put_to_empty_slot_is_readable() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "first.txt");

    let record = Record::first(b"hello".to_vec());
    let version = client.put(slot, record.clone(), None).await.expect("put failed");

    assert_eq!(client.get(slot, None).await, Some(record.clone()));
    assert_eq!(client.get(slot, Some(version)).await, Some(record));

    let digests = client.get_digest(slot).await.expect("digest failed");
    assert_eq!(digests.len(), REPLICAS);
    assert!(digests.iter().all(|(_, d)| d.head().map(|h| h.version) == Some(version)));
}

#[tokio::test]
async fn newer_racing_writer_wins_and_older_write_is_lost() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let keys = Keypair::generate();
    let a = client(&swarm);
    let b = client(&swarm);
    let slot = Slot::from_names("alice", "files", "shared.txt");

    let v0 = Record::first(b"v0".to_vec()).protected_by(keys.identity());
    a.put(slot, v0.clone(), Some(&keys)).await.expect("seed put failed");
    let base = v0.version.timestamp_ms();

    let from_a = record_at(base + 10, v0.version, b"from-a", &keys);
    let from_b = record_at(base + 20, v0.version, b"from-b", &keys);

    let va = a.put(slot, from_a, Some(&keys)).await.expect("A's put failed");
    let vb = b.put(slot, from_b.clone(), Some(&keys)).await.expect("B's newer put should win");
    assert_eq!(vb, from_b.version);

    let err = a.confirm(slot, va).await.expect_err("A's version should be gone");
    assert_eq!(err.reason, PutFailure::VersionLost);
    assert!(err.is_retryable());

    assert_eq!(a.get(slot, None).await, Some(from_b));
    b.confirm(slot, vb).await.expect("B's version should be held");
}

#[tokio::test]
async fn older_racing_writer_loses() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let keys = Keypair::generate();
    let a = client(&swarm);
    let b = client(&swarm);
    let slot = Slot::from_names("alice", "files", "contended.txt");

    let v0 = Record::first(b"v0".to_vec()).protected_by(keys.identity());
    a.put(slot, v0.clone(), Some(&keys)).await.unwrap();
    let base = v0.version.timestamp_ms();

    let va = a
        .put(slot, record_at(base + 20, v0.version, b"from-a", &keys), Some(&keys))
        .await
        .unwrap();
    let err = b
        .put(slot, record_at(base + 10, v0.version, b"from-b", &keys), Some(&keys))
        .await
        .expect_err("B's older put should lose");

    assert_eq!(err.reason, PutFailure::LostRace);
    assert!(err.is_retryable());
    assert!(err.statuses.iter().all(|(_, s)| s.is_version_conflict()));
    a.confirm(slot, va).await.expect("A's version should still be head");
}

#[tokio::test]
async fn equal_timestamp_conflicts_resolve_by_version_key() {
    let keys = Keypair::generate();
    let mut winners = Vec::new();

    // Same pair of writes, both arrival orders; the larger key must win each time.
    for a_first in [true, false, true] {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let c = client(&swarm);
        let slot = Slot::from_names("alice", "files", "tie.txt");
        let v0 = record_at(1_000, VersionKey::ZERO, b"v0", &keys);
        c.put(slot, v0.clone(), Some(&keys)).await.unwrap();

        let ra = record_at(2_000, v0.version, b"payload-a", &keys);
        let rb = record_at(2_000, v0.version, b"payload-b", &keys);
        let (first, second) = if a_first { (ra.clone(), rb.clone()) } else { (rb.clone(), ra.clone()) };

        c.put(slot, first, Some(&keys)).await.unwrap();
        let _ = c.put(slot, second, Some(&keys)).await;

        let head = c.get(slot, None).await.expect("slot should have a head");
        assert_eq!(head.version, ra.version.max(rb.version));
        winners.push(head.version);
    }
    assert!(winners.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn removal_with_wrong_key_is_rejected_and_data_survives() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let owner = Keypair::generate();
    let intruder = Keypair::generate();
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "private.txt");

    let record = Record::first(b"secret".to_vec()).protected_by(owner.identity());
    let version = client.put(slot, record.clone(), Some(&owner)).await.unwrap();

    swarm.reset_calls();
    let err = client
        .remove(slot, Some(version), Some(&intruder))
        .await
        .expect_err("foreign removal must fail");
    assert_eq!(err.reason, RemoveFailure::SecurityRejected);
    assert_eq!(err.attempts, 1);
    assert_eq!(err.holdouts.len(), REPLICAS);
    assert_eq!(swarm.calls().removes, 1);

    assert_eq!(client.get(slot, Some(version)).await, Some(record));

    client.remove(slot, Some(version), Some(&owner)).await.expect("owner removal failed");
    assert_eq!(client.get(slot, None).await, None);
}

#[tokio::test]
async fn unsigned_or_foreign_writes_to_protected_slot_are_terminal() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let owner = Keypair::generate();
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "profile", "profile");

    let v1 = Record::first(b"v1".to_vec()).protected_by(owner.identity());
    client.put(slot, v1.clone(), Some(&owner)).await.unwrap();

    let v2 = Record::successor(v1.version, b"v2".to_vec()).protected_by(owner.identity());
    for keys in [None, Some(Keypair::generate())] {
        swarm.reset_calls();
        let err = client.put(slot, v2.clone(), keys.as_ref()).await.unwrap_err();
        assert_eq!(err.reason, PutFailure::SecurityRejected);
        assert!(!err.is_retryable());
        assert_eq!(err.attempts, 1);
        assert_eq!(swarm.calls().puts, 1);
    }
    assert_eq!(client.get(slot, None).await, Some(v1));
}

#[tokio::test]
async fn protection_key_can_be_handed_over_explicitly() {
    let swarm = LocalSwarm::with_replicas(3, 3);
    let old_owner = Keypair::generate();
    let new_owner = Keypair::generate();
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "handover.txt");

    let v1 = Record::first(b"v1".to_vec()).protected_by(old_owner.identity());
    client.put(slot, v1.clone(), Some(&old_owner)).await.unwrap();

    let v2 = Record::successor(v1.version, b"v2".to_vec()).protected_by(new_owner.identity());
    let err = client.put(slot, v2.clone(), Some(&old_owner)).await.unwrap_err();
    assert_eq!(err.reason, PutFailure::SecurityRejected);

    let options = PutOptions {
        change_protection: true,
        ..PutOptions::default()
    };
    client.put_with(slot, v2.clone(), Some(&old_owner), options).await.unwrap();

    let v3 = Record::successor(v2.version, b"v3".to_vec()).protected_by(new_owner.identity());
    assert!(client.put(slot, v3.clone(), Some(&old_owner)).await.is_err());
    client.put(slot, v3, Some(&new_owner)).await.unwrap();
}

#[tokio::test]
async fn missing_slot_is_not_an_error_unless_required() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let client = client(&swarm);
    let slot = Slot::from_names("nobody", "files", "nothing");

    swarm.reset_calls();
    assert_eq!(client.get(slot, None).await, None);
    assert_eq!(swarm.calls().gets, DEFAULT_MAX_ATTEMPTS as u64);

    let err = client.get_required(slot, None).await.expect_err("required read should fail");
    assert_eq!(err.slot, slot);
    assert_eq!(err.attempts, DEFAULT_MAX_ATTEMPTS);
}

#[tokio::test]
async fn minority_of_unreachable_or_rejecting_replicas_is_tolerated() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "flaky.txt");
    let ids = swarm.responsible_for(&slot);

    swarm.set_unreachable(ids[0], true).await;
    swarm.set_rejecting(ids[1], true).await;

    let record = Record::first(b"tolerant".to_vec());
    let version = client.put(slot, record.clone(), None).await.expect("minority faults must be tolerated");
    assert_eq!(swarm.calls().puts, 1);
    assert_eq!(client.get(slot, Some(version)).await, Some(record));
}

#[tokio::test]
async fn retries_stop_after_exactly_the_configured_attempts() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let slot = Slot::from_names("alice", "files", "unlucky.txt");
    for id in swarm.responsible_for(&slot) {
        swarm.set_unreachable(id, true).await;
    }

    for attempts in [1u32, 2, 4] {
        let client = StoreClient::new(
            swarm.clone(),
            Keypair::generate().identity(),
            ClientConfig {
                max_put_attempts: attempts,
                max_get_attempts: attempts,
                max_remove_attempts: attempts,
                ..config()
            },
        );

        swarm.reset_calls();
        let err = client.put(slot, Record::first(b"x".to_vec()), None).await.unwrap_err();
        assert_eq!(err.reason, PutFailure::RetriesExhausted);
        assert_eq!(err.attempts, attempts);
        assert_eq!(swarm.calls().puts, attempts as u64);

        swarm.reset_calls();
        assert!(client.get_required(slot, None).await.is_err());
        assert_eq!(swarm.calls().gets, attempts as u64);
    }
}

#[tokio::test]
async fn repeated_put_of_same_record_is_idempotent() {
    let swarm = LocalSwarm::with_replicas(3, 3);
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "twice.txt");

    let record = Record::first(b"same".to_vec());
    let first = client.put(slot, record.clone(), None).await.unwrap();
    let second = client.put(slot, record.clone(), None).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(client.get(slot, Some(first)).await, Some(record));

    let digests = swarm.digest(slot, DigestRange::all(), None).await.unwrap();
    assert!(digests.iter().all(|(_, d)| d.len() == 1));
}

#[tokio::test]
async fn accepted_writes_form_a_single_linked_chain() {
    let swarm = LocalSwarm::with_replicas(REPLICAS, REPLICAS);
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "chain.txt");

    let mut parent = VersionKey::ZERO;
    for i in 0..4 {
        let record = Record::successor(parent, format!("v{i}").into_bytes());
        parent = client.put(slot, record, None).await.unwrap();
    }
    // A write based on a superseded version is refused.
    let digests = client.get_digest(slot).await.unwrap();
    let first = digests[0].1.entries[0].version;
    let stale = Record {
        version: VersionKey::derive_at(first.timestamp_ms(), &first, b"stale"),
        based_on: first,
        payload: b"stale".to_vec(),
        ttl_secs: 60,
        protection: None,
    };
    assert!(client.put(slot, stale, None).await.is_err());

    for (_, digest) in client.get_digest(slot).await.unwrap() {
        assert_eq!(digest.len(), 4);
        assert_eq!(digest.entries[0].based_on, VersionKey::ZERO);
        for pair in digest.entries.windows(2) {
            assert_eq!(pair[1].based_on, pair[0].version);
        }
        assert_eq!(digest.head().map(|h| h.version), Some(parent));
    }
}

#[tokio::test]
async fn staged_divergence_is_healed_by_conflict_resolution() {
    let swarm = LocalSwarm::with_replicas(3, 3);
    let client = client(&swarm);
    let slot = Slot::from_names("alice", "files", "diverged.txt");
    let ids = swarm.responsible_for(&slot);

    let v0 = Record::first(b"v0".to_vec());
    client.put(slot, v0.clone(), None).await.unwrap();

    // One replica already took a competing, older sibling.
    let base = v0.version.timestamp_ms();
    let sibling = Record {
        version: VersionKey::derive_at(base + 1, &v0.version, b"sibling"),
        based_on: v0.version,
        payload: b"sibling".to_vec(),
        ttl_secs: 60,
        protection: None,
    };
    let staged = swarm
        .put_to(&ids[..1], tessera::PutRequest::new(client.identity(), slot, sibling.clone()))
        .await;
    assert_eq!(staged, vec![(ids[0], PutStatus::Ok)]);

    let ours = Record {
        version: VersionKey::derive_at(base + 50, &v0.version, b"ours"),
        based_on: v0.version,
        payload: b"ours".to_vec(),
        ttl_secs: 60,
        protection: None,
    };
    let version = client.put(slot, ours, None).await.unwrap();

    for (_, digest) in client.get_digest(slot).await.unwrap() {
        assert_eq!(digest.head().map(|h| h.version), Some(version));
        assert!(!digest.contains(&sibling.version));
    }
}

#[tokio::test]
async fn fork_healing_does_not_spend_the_last_attempt() {
    let swarm = LocalSwarm::with_replicas(3, 3);
    let client = StoreClient::new(
        swarm.clone(),
        Keypair::generate().identity(),
        ClientConfig {
            max_put_attempts: 1,
            ..config()
        },
    );
    let slot = Slot::from_names("alice", "files", "single-shot.txt");
    let ids = swarm.responsible_for(&slot);

    let v0 = Record::first(b"v0".to_vec());
    client.put(slot, v0.clone(), None).await.unwrap();
    let base = v0.version.timestamp_ms();

    let sibling = Record {
        version: VersionKey::derive_at(base + 1, &v0.version, b"sibling"),
        based_on: v0.version,
        payload: b"sibling".to_vec(),
        ttl_secs: 60,
        protection: None,
    };
    swarm
        .put_to(&ids[..1], tessera::PutRequest::new(client.identity(), slot, sibling.clone()))
        .await;

    let ours = Record {
        version: VersionKey::derive_at(base + 50, &v0.version, b"ours"),
        based_on: v0.version,
        payload: b"ours".to_vec(),
        ttl_secs: 60,
        protection: None,
    };
    swarm.reset_calls();
    let version = client.put(slot, ours, None).await.expect("newer write must win with one attempt");
    assert_eq!(swarm.calls().puts, 2);

    for (_, digest) in client.get_digest(slot).await.unwrap() {
        assert_eq!(digest.head().map(|h| h.version), Some(version));
        assert!(!digest.contains(&sibling.version));
    }
}

#[tokio::test]
async fn later_first_version_loses_to_the_existing_one() {
    for verify_put in [true, false] {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let cfg = ClientConfig { verify_put, ..config() };
        let a = StoreClient::new(swarm.clone(), Keypair::generate().identity(), cfg.clone());
        let b = StoreClient::new(swarm.clone(), Keypair::generate().identity(), cfg);
        let slot = Slot::from_names("alice", "files", "first-wins.txt");

        let from_a = Record {
            version: VersionKey::derive_at(1_000, &VersionKey::ZERO, b"from-a"),
            based_on: VersionKey::ZERO,
            payload: b"from-a".to_vec(),
            ttl_secs: 60,
            protection: None,
        };
        let from_b = Record {
            version: VersionKey::derive_at(2_000, &VersionKey::ZERO, b"from-b"),
            based_on: VersionKey::ZERO,
            payload: b"from-b".to_vec(),
            ttl_secs: 60,
            protection: None,
        };

        let va = a.put(slot, from_a.clone(), None).await.unwrap();
        let err = b.put(slot, from_b.clone(), None).await.expect_err("second first version must fail");
        assert_eq!(err.reason, PutFailure::VersionLost, "verify_put = {verify_put}");
        assert!(err.is_conflict());
        assert!(err.statuses.iter().all(|(_, s)| *s == PutStatus::VersionConflictNoBasedOn));

        assert_eq!(a.get(slot, None).await, Some(from_a));
        for (_, digest) in a.get_digest(slot).await.unwrap() {
            assert_eq!(digest.head().map(|h| h.version), Some(va));
            assert!(!digest.contains(&from_b.version));
        }
    }
}

#[tokio::test]
async fn simultaneous_first_versions_never_both_succeed() {
    for _ in 0..5 {
        let swarm = LocalSwarm::with_replicas(3, 3);
        let a = client(&swarm);
        let b = client(&swarm);
        let slot = Slot::from_names("alice", "files", "simultaneous.txt");

        let ra = Record::first(b"from-a".to_vec());
        let rb = Record::first(b"from-b".to_vec());
        let (ra_result, rb_result) = tokio::join!(a.put(slot, ra.clone(), None), b.put(slot, rb.clone(), None));
        assert!(ra_result.is_err() || rb_result.is_err(), "both first versions were reported committed");

        // A failed writer's version is cleaned up everywhere.
        let digests = a.get_digest(slot).await.unwrap();
        for (result, record) in [(&ra_result, &ra), (&rb_result, &rb)] {
            match result {
                Ok(version) => assert_eq!(a.get(slot, Some(*version)).await.as_ref(), Some(record)),
                Err(e) => {
                    assert!(e.is_conflict() || e.reason == PutFailure::RetriesExhausted);
                    assert!(digests.iter().all(|(_, d)| !d.contains(&record.version)));
                }
            }
        }
    }
}
