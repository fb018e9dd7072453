use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tessera::{
    CallerId, ClientConfig, FileEntry, Keypair, LocalSwarm, ProfileConfig, ProfileManager, Record, Slot,
    StoreClient, SwarmConfig,
};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Replicas in the in-process swarm.
    #[arg(short, long, default_value = "8")]
    replicas: usize,

    /// Replicas holding each slot.
    #[arg(short = 'k', long, default_value = "5")]
    replication_factor: usize,

    /// Concurrent local profile writers.
    #[arg(short, long, default_value = "4")]
    writers: u64,

    /// Profile updates per writer.
    #[arg(long, default_value = "3")]
    rounds: u64,

    /// Responsible replicas to make unreachable before the run.
    #[arg(long, default_value = "1")]
    unreachable: usize,

    #[arg(long, default_value = "alice")]
    user: String,

    /// Seconds between telemetry snapshots after the run; 0 exits immediately.
    #[arg(short, long, default_value = "0")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let swarm = LocalSwarm::new(SwarmConfig {
        replicas: args.replicas,
        replication_factor: args.replication_factor,
        ..SwarmConfig::default()
    });
    let user_keys = Keypair::generate();
    let device = Keypair::generate();
    info!("User identity: {}", user_keys.identity());

    let client = StoreClient::new(swarm.clone(), device.identity(), ClientConfig::default());
    let profiles = ProfileManager::new(client.clone(), user_keys.clone(), &args.user, ProfileConfig::default());

    for id in swarm.responsible_for(&profiles.slot()).into_iter().take(args.unreachable) {
        warn!(replica = %id.short_hex(), "marking replica unreachable");
        swarm.set_unreachable(id, true).await;
    }

    let mut writers = JoinSet::new();
    for writer in 0..args.writers {
        let profiles = profiles.clone();
        let rounds = args.rounds;
        writers.spawn(async move {
            let caller = CallerId(writer);
            let mut committed = 0u64;
            for round in 0..rounds {
                let path = format!("writer-{writer}/file-{round}.bin");
                let result = profiles
                    .update(caller, |profile| {
                        profile.upsert_file(
                            path,
                            FileEntry {
                                size: 1024 * (round + 1),
                                chunks: vec![*blake3::hash(&round.to_be_bytes()).as_bytes()],
                                modified_ms: round,
                            },
                        );
                    })
                    .await;
                match result {
                    Ok(version) => {
                        committed += 1;
                        info!(caller = %caller, version = %version, "profile updated");
                    }
                    Err(e) => warn!(caller = %caller, error = %e, retryable = e.is_retryable(), "profile update failed"),
                }
            }
            committed
        });
    }

    let mut committed = 0;
    while let Some(joined) = writers.join_next().await {
        committed += joined.context("writer task panicked")?;
    }

    let snapshot = profiles
        .acquire(CallerId(u64::MAX), false)
        .await
        .context("final profile read failed")?;
    info!(
        committed,
        files = snapshot.profile.files.len(),
        version = %snapshot.version,
        "profile workload finished"
    );

    // Owner-only removal: a foreign key is rejected, the owner's key succeeds.
    let scratch = Slot::from_names(&args.user, "files", "scratch");
    let record = Record::first(b"scratch".to_vec()).protected_by(user_keys.identity());
    let version = client.put(scratch, record, Some(&user_keys)).await?;
    if let Err(e) = client.remove(scratch, Some(version), Some(&Keypair::generate())).await {
        info!(error = %e, "foreign removal rejected");
    }
    client.remove(scratch, Some(version), Some(&user_keys)).await?;
    info!(slot = %scratch, "owner removal verified");

    if args.telemetry_interval > 0 {
        let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));
        // Graceful shutdown on Ctrl+C
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, exiting gracefully");
                    break;
                }
                _ = interval.tick() => log_telemetry(&swarm, &profiles).await,
            }
        }
    } else {
        log_telemetry(&swarm, &profiles).await;
    }

    profiles.quit().await;
    swarm.quit().await;
    Ok(())
}

async fn log_telemetry(swarm: &LocalSwarm, profiles: &ProfileManager<LocalSwarm>) {
    let profile = profiles.telemetry().await;
    info!(
        cached_version = ?profile.cached_version,
        commits = profile.commits,
        failed_commits = profile.failed_commits,
        expired_leases = profile.expired_leases,
        "profile telemetry"
    );
    let calls = swarm.calls();
    info!(puts = calls.puts, gets = calls.gets, removes = calls.removes, digests = calls.digests, "substrate calls");
    for (id, replica) in swarm.telemetry().await {
        info!(
            replica = %id.short_hex(),
            slots = replica.stored_slots,
            versions = replica.stored_versions,
            bytes = replica.stored_bytes,
            accepted = replica.puts_accepted,
            rejected = replica.puts_rejected,
            "replica telemetry"
        );
    }
}
