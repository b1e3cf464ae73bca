use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use scoot_types::{LogIndex, NodeId, Round, ScootError};

use crate::acceptor::{Acceptor, Promise};
use crate::rpc;

/// Default deadline for one Paxos RPC to one peer.
pub const PAXOS_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// What a slot ended up deciding: the value echo and the command bytes
/// every replica will apply. When the command differs from what the caller
/// submitted, the caller lost the slot to a competing proposer.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub value: i64,
    pub command: Vec<u8>,
}

/// The active Paxos role: drives one command to decision in a target slot.
///
/// Any replica may propose; competing proposers are resolved by the
/// `(ballot, id)` round order, and a loser retries at a fresh slot chosen
/// by the caller.
pub struct Proposer {
    id: NodeId,
    ballot: Mutex<i64>,
    peers: Vec<String>,
    local: Arc<Acceptor>,
    rpc_timeout: Duration,
}

impl Proposer {
    pub fn new(id: NodeId, peers: Vec<String>, local: Arc<Acceptor>) -> Self {
        Self::with_timeout(id, peers, local, PAXOS_RPC_TIMEOUT)
    }

    pub fn with_timeout(
        id: NodeId,
        peers: Vec<String>,
        local: Arc<Acceptor>,
        rpc_timeout: Duration,
    ) -> Self {
        Proposer {
            id,
            ballot: Mutex::new(0),
            peers,
            local,
            rpc_timeout,
        }
    }

    /// The mutex only covers ballot allocation; the round is unique across
    /// proposers because the node id rides in the pair.
    async fn next_round(&self) -> Round {
        let mut ballot = self.ballot.lock().await;
        *ballot += 1;
        Round::new(*ballot, self.id)
    }

    /// Drive `(value, command)` to decision in `instance_id`.
    ///
    /// Unreachable peers count as negative votes; either phase falling
    /// short of the majority fails the proposal as retryable. The returned
    /// decision is whatever the slot actually chose, which may be a
    /// competing proposer's pair adopted during Phase 1.
    pub async fn propose(
        &self,
        value: i64,
        instance_id: LogIndex,
        command: &[u8],
    ) -> Result<Decision, ScootError> {
        let round = self.next_round().await;
        let total = self.peers.len() + 1;
        let majority = total / 2 + 1;

        // Phase 1: parallel Prepare fan-out plus the local acceptor.
        let mut promises: Vec<Promise> = Vec::with_capacity(total);
        let mut prepares = JoinSet::new();
        for peer in &self.peers {
            let peer = peer.clone();
            let timeout = self.rpc_timeout;
            prepares.spawn(async move { rpc::prepare(&peer, round, instance_id, timeout).await });
        }
        while let Some(joined) = prepares.join_next().await {
            if let Ok(Some(promise)) = joined {
                if promise.ack {
                    promises.push(promise);
                }
            }
        }
        let local_promise = self.local.prepare(round, instance_id).await;
        if local_promise.ack {
            promises.push(local_promise);
        }

        if promises.len() < majority {
            return Err(ScootError::NoQuorum {
                phase: "prepare",
                got: promises.len(),
                need: majority,
            });
        }

        // Adopt the pair accepted at the highest round, if any promise
        // carries one; otherwise the caller's pair stands.
        let mut chosen_value = value;
        let mut chosen_command = command.to_vec();
        let mut highest = Round::ZERO;
        for promise in &promises {
            if promise.last_good_round > highest {
                highest = promise.last_good_round;
                chosen_value = promise.value;
                chosen_command = promise.command.clone();
            }
        }
        if highest != Round::ZERO {
            debug!(
                slot = instance_id,
                adopted_round = %highest,
                "adopting previously accepted value"
            );
        }

        // Phase 2: parallel Accept fan-out plus the local acceptor.
        let mut acks = 0usize;
        let mut accepts = JoinSet::new();
        for peer in &self.peers {
            let peer = peer.clone();
            let command = chosen_command.clone();
            let timeout = self.rpc_timeout;
            accepts.spawn(async move {
                rpc::accept(&peer, round, chosen_value, command, instance_id, timeout).await
            });
        }
        while let Some(joined) = accepts.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
            }
        }
        if self
            .local
            .accept(round, chosen_value, &chosen_command, instance_id)
            .await
        {
            acks += 1;
        }

        if acks < majority {
            return Err(ScootError::NoQuorum {
                phase: "accept",
                got: acks,
                need: majority,
            });
        }

        // Phase 3: asynchronous broadcast to peers, synchronous locally. A
        // peer that misses its Commit learns the slot from Recovery or a
        // later Prepare.
        for peer in &self.peers {
            let peer = peer.clone();
            let command = chosen_command.clone();
            let timeout = self.rpc_timeout;
            tokio::spawn(async move {
                rpc::commit(&peer, chosen_value, instance_id, command, timeout).await;
            });
        }
        self.local
            .commit(chosen_value, instance_id, &chosen_command)
            .await;

        Ok(Decision {
            value: chosen_value,
            command: chosen_command,
        })
    }
}
