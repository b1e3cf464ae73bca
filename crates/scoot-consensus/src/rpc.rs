//! Ad-hoc tonic clients for the peer surface. Every call dials its own
//! channel with a bounded deadline; any transport failure is reported as
//! `None`/`false` so Paxos can count the peer as a silent vote.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use scoot_proto::v1::log_recovery_client::LogRecoveryClient;
use scoot_proto::v1::paxos_client::PaxosClient;
use scoot_proto::v1::{AcceptRequest, CommitRequest, GetLogRequest, GetLogResponse, PrepareRequest};
use scoot_types::{LogIndex, Round, ScootError};

use crate::acceptor::Promise;

fn endpoint_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

async fn connect(addr: &str, timeout: Duration) -> Result<Channel, ScootError> {
    Endpoint::from_shared(endpoint_uri(addr))
        .map_err(|e| ScootError::Transport(e.to_string()))?
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect()
        .await
        .map_err(|e| ScootError::Transport(e.to_string()))
}

/// Phase 1 to one peer. `None` means the peer stayed silent.
pub async fn prepare(
    addr: &str,
    round: Round,
    instance_id: LogIndex,
    timeout: Duration,
) -> Option<Promise> {
    let channel = connect(addr, timeout).await.ok()?;
    let mut client = PaxosClient::new(channel);
    let response = client
        .prepare(PrepareRequest {
            round: round.to_wire(),
            instance_id,
        })
        .await
        .ok()?
        .into_inner();

    Some(Promise {
        round,
        ack: response.ack,
        last_good_round: Round::from_wire(&response.last_good_round)?,
        value: response.value,
        command: response.command,
    })
}

/// Phase 2 to one peer. Silence counts as a negative vote.
pub async fn accept(
    addr: &str,
    round: Round,
    value: i64,
    command: Vec<u8>,
    instance_id: LogIndex,
    timeout: Duration,
) -> bool {
    let Ok(channel) = connect(addr, timeout).await else {
        return false;
    };
    let mut client = PaxosClient::new(channel);
    client
        .accept(AcceptRequest {
            round: round.to_wire(),
            value,
            command,
            instance_id,
        })
        .await
        .map(|r| r.into_inner().ack)
        .unwrap_or(false)
}

/// Phase 3 to one peer, fire-and-forget: a lost Commit leaves the peer to
/// catch up via Recovery or a later Prepare.
pub async fn commit(addr: &str, value: i64, instance_id: LogIndex, command: Vec<u8>, timeout: Duration) {
    let Ok(channel) = connect(addr, timeout).await else {
        return;
    };
    let mut client = PaxosClient::new(channel);
    let _ = client
        .commit(CommitRequest {
            value,
            instance_id,
            command,
        })
        .await;
}

/// Pull the snapshot + log suffix from one peer during recovery.
pub async fn fetch_log(
    addr: &str,
    starting_index: LogIndex,
    timeout: Duration,
) -> Option<GetLogResponse> {
    let channel = connect(addr, timeout).await.ok()?;
    let mut client = LogRecoveryClient::new(channel);
    client
        .get_log(GetLogRequest { starting_index })
        .await
        .ok()
        .map(|r| r.into_inner())
}
