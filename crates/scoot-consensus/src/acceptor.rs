use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use scoot_state::{ReplicatedLog, ScooterStateMachine};
use scoot_types::{LogIndex, Round};

/// Per-slot acceptor state, materialized on first reference.
#[derive(Debug, Clone, Default)]
struct InstanceState {
    /// Highest round promised.
    last_round: Round,
    /// Round at which `value`/`command` were accepted.
    last_good_round: Round,
    value: i64,
    command: Vec<u8>,
    /// Monotone: once decided, a slot stays decided.
    decided: bool,
    decided_value: i64,
}

/// Reply to a Prepare. A nack still echoes the accepted state so a
/// competing proposer can see what it lost to.
#[derive(Debug, Clone)]
pub struct Promise {
    pub round: Round,
    pub ack: bool,
    pub last_good_round: Round,
    pub value: i64,
    pub command: Vec<u8>,
}

/// The passive Paxos role: one instance per log slot, all guarded by a
/// single mutex. Handlers are O(1); Commit additionally feeds the log and
/// the state machine.
pub struct Acceptor {
    instances: Mutex<HashMap<LogIndex, InstanceState>>,
    machine: Arc<ScooterStateMachine>,
    log: Arc<ReplicatedLog>,
}

impl Acceptor {
    pub fn new(machine: Arc<ScooterStateMachine>, log: Arc<ReplicatedLog>) -> Self {
        Acceptor {
            instances: Mutex::new(HashMap::new()),
            machine,
            log,
        }
    }

    /// Phase 1: promise iff `round` is strictly above anything promised for
    /// this slot.
    pub async fn prepare(&self, round: Round, instance_id: LogIndex) -> Promise {
        let mut g = self.instances.lock().await;
        let instance = g.entry(instance_id).or_default();

        let ack = round > instance.last_round;
        if ack {
            instance.last_round = round;
        } else {
            debug!(
                slot = instance_id,
                round = %round,
                promised = %instance.last_round,
                "rejecting prepare below promised round"
            );
        }
        Promise {
            round,
            ack,
            last_good_round: instance.last_good_round,
            value: instance.value,
            command: instance.command.clone(),
        }
    }

    /// Phase 2: accept iff `round` is at least the promised round, or the
    /// instance has never been touched (first-writer-wins on untouched
    /// slots). The command bytes are stored with the value so that later
    /// Prepares hand back the full decided payload.
    pub async fn accept(
        &self,
        round: Round,
        value: i64,
        command: &[u8],
        instance_id: LogIndex,
    ) -> bool {
        let mut g = self.instances.lock().await;
        let instance = g.entry(instance_id).or_default();

        if round >= instance.last_round || instance.last_round == Round::ZERO {
            instance.last_round = round;
            instance.last_good_round = round;
            instance.value = value;
            instance.command = command.to_vec();
            true
        } else {
            debug!(
                slot = instance_id,
                round = %round,
                promised = %instance.last_round,
                "rejecting accept below promised round"
            );
            false
        }
    }

    /// Phase 3: first delivery seals the slot, appends to the log, and
    /// applies to the state machine; re-delivery is a no-op. A command the
    /// state machine rejects still occupies its slot.
    pub async fn commit(&self, value: i64, instance_id: LogIndex, command: &[u8]) {
        let mut g = self.instances.lock().await;
        let instance = g.entry(instance_id).or_default();

        if instance.decided {
            return;
        }
        instance.decided = true;
        instance.decided_value = value;

        if !command.is_empty() {
            self.log.append(instance_id, command.to_vec()).await;
            if let Err(err) = self.machine.apply(command).await {
                if err.is_domain() {
                    debug!(slot = instance_id, error = %err, "committed command had no effect");
                } else {
                    warn!(slot = instance_id, error = %err, "committed command failed to apply");
                }
            }
        }
    }

    /// The decided value for a slot, if any.
    pub async fn decision(&self, instance_id: LogIndex) -> Option<i64> {
        let g = self.instances.lock().await;
        g.get(&instance_id)
            .filter(|i| i.decided)
            .map(|i| i.decided_value)
    }
}

#[cfg(test)]
mod tests {
    use scoot_types::ScooterCommand;

    use super::*;

    fn make_acceptor() -> (Arc<ScooterStateMachine>, Arc<ReplicatedLog>, Acceptor) {
        let machine = Arc::new(ScooterStateMachine::new());
        let log = Arc::new(ReplicatedLog::new());
        let acceptor = Acceptor::new(machine.clone(), log.clone());
        (machine, log, acceptor)
    }

    fn create_cmd(id: &str) -> Vec<u8> {
        ScooterCommand::Create { scooter_id: id.into() }.encode().unwrap()
    }

    #[tokio::test]
    async fn prepare_promises_strictly_higher_rounds() {
        let (_, _, acceptor) = make_acceptor();

        let promise = acceptor.prepare(Round::new(1, 1), 0).await;
        assert!(promise.ack);
        assert_eq!(promise.last_good_round, Round::ZERO);

        // Equal round: already promised, nack.
        let promise = acceptor.prepare(Round::new(1, 1), 0).await;
        assert!(!promise.ack);

        // Lower proposer id at the same ballot loses the tiebreak.
        let promise = acceptor.prepare(Round::new(1, 0), 0).await;
        assert!(!promise.ack);

        let promise = acceptor.prepare(Round::new(2, 0), 0).await;
        assert!(promise.ack);
    }

    #[tokio::test]
    async fn nack_still_echoes_accepted_state() {
        let (_, _, acceptor) = make_acceptor();
        let cmd = create_cmd("x");
        assert!(acceptor.accept(Round::new(3, 1), 7, &cmd, 0).await);

        let promise = acceptor.prepare(Round::new(1, 2), 0).await;
        assert!(!promise.ack);
        assert_eq!(promise.last_good_round, Round::new(3, 1));
        assert_eq!(promise.value, 7);
        assert_eq!(promise.command, cmd);
    }

    #[tokio::test]
    async fn accept_honors_promise_and_equal_round() {
        let (_, _, acceptor) = make_acceptor();

        let promise = acceptor.prepare(Round::new(2, 1), 0).await;
        assert!(promise.ack);

        // The round just promised is accepted (>=, not >).
        assert!(acceptor.accept(Round::new(2, 1), 5, b"cmd", 0).await);
        // A stale competitor is not.
        assert!(!acceptor.accept(Round::new(1, 9), 6, b"other", 0).await);
    }

    #[tokio::test]
    async fn untouched_instance_accepts_any_round() {
        let (_, _, acceptor) = make_acceptor();
        // No prepare ever ran for this slot; the zero-round escape lets the
        // first writer through regardless of its round.
        assert!(acceptor.accept(Round::new(1, 3), 9, b"cmd", 4).await);

        let promise = acceptor.prepare(Round::new(5, 1), 4).await;
        assert_eq!(promise.last_good_round, Round::new(1, 3));
        assert_eq!(promise.value, 9);
    }

    #[tokio::test]
    async fn commit_appends_and_applies() {
        let (machine, log, acceptor) = make_acceptor();
        let cmd = create_cmd("x");

        acceptor.commit(0, 0, &cmd).await;

        assert_eq!(acceptor.decision(0).await, Some(0));
        assert_eq!(log.entry(0).await.unwrap().command, cmd);
        assert_eq!(log.commit_index().await, 0);
        assert!(machine.get_scooter("x").await.is_some());
    }

    #[tokio::test]
    async fn commit_is_idempotent_per_slot() {
        let (machine, log, acceptor) = make_acceptor();
        let cmd = create_cmd("x");

        acceptor.commit(0, 0, &cmd).await;
        acceptor.commit(0, 0, &cmd).await;
        acceptor.commit(99, 0, &cmd).await;

        assert_eq!(acceptor.decision(0).await, Some(0));
        assert_eq!(machine.get_scooters().await.len(), 1);
        assert_eq!(log.next_index().await, 1);
    }

    #[tokio::test]
    async fn rejected_command_still_occupies_its_slot() {
        let (machine, log, acceptor) = make_acceptor();
        let cmd = create_cmd("x");

        acceptor.commit(0, 0, &cmd).await;
        // A duplicate CREATE decided at slot 1 is committed but ineffective.
        acceptor.commit(1, 1, &cmd).await;

        assert_eq!(acceptor.decision(1).await, Some(1));
        assert!(log.entry(1).await.is_some());
        assert_eq!(machine.get_scooters().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_command_decides_without_touching_log() {
        let (_, log, acceptor) = make_acceptor();
        acceptor.commit(3, 3, &[]).await;
        assert_eq!(acceptor.decision(3).await, Some(3));
        assert!(log.entry(3).await.is_none());
        assert_eq!(log.next_index().await, 0);
    }
}
