//! Remove protocol: signed delete followed by a verifying raw read.
//!
//! The verifying read goes straight to the replicas (it is not itself
//! retried). Any replica still returning the targeted data sends the whole
//! remove around again, up to the configured attempt bound. An ownership
//! rejection ends the protocol immediately after the verifying read.

use std::fmt;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::ClientConfig;
use crate::identity::{Identity, Keypair};
use crate::messages::{RemoveRequest, RemoveStatus};
use crate::protocols::StorageRpc;
use crate::record::{Slot, VersionKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveFailure {
    RetriesExhausted,
    SecurityRejected,
}

impl fmt::Display for RemoveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveFailure::RetriesExhausted => write!(f, "data still present after retries"),
            RemoveFailure::SecurityRejected => write!(f, "rejected by ownership check"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveFailed {
    pub slot: Slot,
    pub version: Option<VersionKey>,
    pub reason: RemoveFailure,
    pub attempts: u32,
    /// Replicas that still returned the targeted data on the last check.
    pub holdouts: Vec<Identity>,
}

impl fmt::Display for RemoveFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "remove of {} from slot {}", v, self.slot)?,
            None => write!(f, "remove of slot {}", self.slot)?,
        }
        write!(
            f,
            " failed after {} attempt(s): {} ({} replica(s) still holding)",
            self.attempts,
            self.reason,
            self.holdouts.len()
        )
    }
}

impl std::error::Error for RemoveFailed {}

pub(crate) async fn run_remove<N: StorageRpc>(
    network: &N,
    config: &ClientConfig,
    from: Identity,
    slot: Slot,
    version: Option<VersionKey>,
    keys: Option<&Keypair>,
) -> Result<(), RemoveFailed> {
    let max_attempts = config.max_remove_attempts.max(1);
    let mut holdouts = Vec::new();

    for attempt in 1..=max_attempts {
        let request = RemoveRequest::new(from, slot, version).signed(keys);
        let rejected = match network.remove(request).await {
            Ok(statuses) => {
                debug!(slot = %slot, attempt, replies = statuses.len(), "remove delivered");
                statuses.iter().any(|(_, s)| *s == RemoveStatus::FailedSecurity)
            }
            Err(e) => {
                warn!(slot = %slot, attempt, error = %e, "remove transport failure");
                false
            }
        };

        let verified = match network.get(slot, version).await {
            Ok(replies) => {
                holdouts = replies
                    .iter()
                    .filter(|(_, record)| record.is_some())
                    .map(|(id, _)| *id)
                    .collect();
                true
            }
            Err(e) => {
                warn!(slot = %slot, attempt, error = %e, "verifying read failed");
                false
            }
        };

        if rejected {
            warn!(slot = %slot, holdouts = holdouts.len(), "remove rejected by ownership check");
            return Err(RemoveFailed {
                slot,
                version,
                reason: RemoveFailure::SecurityRejected,
                attempts: attempt,
                holdouts,
            });
        }
        if verified && holdouts.is_empty() {
            info!(slot = %slot, version = ?version, attempts = attempt, "remove verified");
            return Ok(());
        }
        if attempt < max_attempts {
            sleep(config.retry_backoff).await;
        }
    }

    warn!(slot = %slot, version = ?version, holdouts = holdouts.len(), "remove failed");
    Err(RemoveFailed {
        slot,
        version,
        reason: RemoveFailure::RetriesExhausted,
        attempts: max_attempts,
        holdouts,
    })
}
