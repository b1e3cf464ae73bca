//! Startup catch-up. The server side packages the snapshot plus the log
//! suffix; the client side walks the configured peers in order and installs
//! the first answer it gets. There is no background reconciliation:
//! divergence is prevented by consensus on writes, not repaired here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use scoot_proto::v1::{GetLogResponse, LogEntry as WireLogEntry};
use scoot_state::{LogEntry, ReplicatedLog, ScooterStateMachine};
use scoot_types::{LogIndex, ScootError};

use crate::rpc;

/// Default deadline for one GetLog call to one peer.
pub const RECOVERY_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a lagging replica needs: log suffix, commit watermark, and
/// the snapshot the suffix builds on.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBundle {
    pub entries: Vec<LogEntry>,
    pub commit_index: LogIndex,
    pub snapshot_data: Vec<u8>,
    pub snapshot_index: LogIndex,
}

impl LogBundle {
    pub fn from_wire(response: GetLogResponse) -> Self {
        LogBundle {
            entries: response
                .log_entry
                .into_iter()
                .map(|e| LogEntry {
                    index: e.index,
                    command: e.command,
                })
                .collect(),
            commit_index: response.commit_index,
            snapshot_data: response.snapshot_data,
            snapshot_index: response.snapshot_index,
        }
    }

    pub fn into_wire(self) -> GetLogResponse {
        GetLogResponse {
            log_entry: self
                .entries
                .into_iter()
                .map(|e| WireLogEntry {
                    index: e.index,
                    command: e.command,
                })
                .collect(),
            commit_index: self.commit_index,
            snapshot_data: self.snapshot_data,
            snapshot_index: self.snapshot_index,
        }
    }
}

/// Server side: package the state a peer starting at `starting_index`
/// needs. A start that precedes the snapshot gets the snapshot and only
/// the entries strictly after it.
pub async fn collect_log(
    machine: &ScooterStateMachine,
    log: &ReplicatedLog,
    starting_index: LogIndex,
) -> LogBundle {
    let (snapshot_data, snapshot_index) = machine.snapshot().await;

    let start = if starting_index < snapshot_index {
        snapshot_index + 1
    } else {
        starting_index
    };

    LogBundle {
        entries: log.entries_from(start).await,
        commit_index: log.commit_index().await,
        snapshot_data,
        snapshot_index,
    }
}

/// Client side: fold one peer's bundle into the local state. Loads the
/// snapshot when it reaches past everything we have, then replays the
/// suffix in index order.
pub async fn install(
    bundle: LogBundle,
    machine: &ScooterStateMachine,
    log: &ReplicatedLog,
) -> Result<(), ScootError> {
    let local_next = log.next_index().await;

    if !bundle.snapshot_data.is_empty() && bundle.snapshot_index >= local_next {
        machine
            .load_snapshot(&bundle.snapshot_data, bundle.snapshot_index)
            .await?;
        log.set_stored_index(bundle.snapshot_index).await;
        log.set_commit_index(bundle.snapshot_index).await;
        log.set_next_index(bundle.snapshot_index + 1).await;
    }

    for entry in bundle.entries {
        log.append(entry.index, entry.command.clone()).await;
        if let Err(err) = machine.apply(&entry.command).await {
            // A command some replica already rejected stays rejected here.
            debug!(index = entry.index, error = %err, "replayed command had no effect");
        }
    }
    log.set_commit_index(bundle.commit_index).await;
    Ok(())
}

/// Boot-time catch-up: first reachable peer wins. Best effort; with no
/// reachable peer the replica simply starts empty.
pub async fn recover(
    peers: &[String],
    machine: &Arc<ScooterStateMachine>,
    log: &Arc<ReplicatedLog>,
    timeout: Duration,
) {
    for peer in peers {
        let starting_index = log.next_index().await;
        let Some(response) = rpc::fetch_log(peer, starting_index, timeout).await else {
            debug!(peer = %peer, "recovery peer unreachable");
            continue;
        };
        match install(LogBundle::from_wire(response), machine, log).await {
            Ok(()) => {
                let commit_index = log.commit_index().await;
                info!(peer = %peer, commit_index, "recovered from peer");
                return;
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "recovery payload rejected");
            }
        }
    }
    info!("no recovery peer answered; starting empty");
}
