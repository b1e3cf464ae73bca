use serde::{Deserialize, Serialize};

pub type NodeId = i64;
pub type LogIndex = i64;

/// A rentable scooter as tracked by the replicated state machine.
///
/// `is_available` and `reservation_id` move together: a scooter is
/// available exactly when `reservation_id` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scooter {
    pub id: String,
    pub is_available: bool,
    pub total_distance: f64,
    pub reservation_id: String,
}

impl Scooter {
    /// A freshly created scooter: available, zero distance, no reservation.
    pub fn new(id: impl Into<String>) -> Self {
        Scooter {
            id: id.into(),
            is_available: true,
            total_distance: 0.0,
            reservation_id: String::new(),
        }
    }
}

/// Commands decided through consensus and interpreted by the state machine.
///
/// The encoded form is self-describing JSON tagged by `command_type`; the
/// bytes are carried verbatim through the log, so every replica decodes the
/// exact payload that was decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type")]
pub enum ScooterCommand {
    #[serde(rename = "CREATE")]
    Create { scooter_id: String },
    #[serde(rename = "RESERVE")]
    Reserve {
        scooter_id: String,
        reservation_id: String,
    },
    #[serde(rename = "RELEASE")]
    Release { scooter_id: String, distance: i64 },
    #[serde(rename = "NOOP")]
    Noop,
}

impl ScooterCommand {
    pub fn encode(&self) -> Result<Vec<u8>, ScootError> {
        serde_json::to_vec(self).map_err(|e| ScootError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ScootError> {
        serde_json::from_slice(bytes).map_err(|e| ScootError::Codec(e.to_string()))
    }
}

/// A Paxos round: `(ballot, proposer id)` with lexicographic order.
///
/// The field order gives the derived `Ord` exactly that comparison. The
/// zero round marks an acceptor instance nobody has touched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Round {
    pub ballot: i64,
    pub proposer: NodeId,
}

impl Round {
    pub const ZERO: Self = Round { ballot: 0, proposer: 0 };

    pub const fn new(ballot: i64, proposer: NodeId) -> Self {
        Round { ballot, proposer }
    }

    /// Wire form: a 2-element `repeated int64`, `[ballot, proposer]`.
    pub fn to_wire(self) -> Vec<i64> {
        vec![self.ballot, self.proposer]
    }

    /// Parse the wire pair; anything but exactly two elements is malformed.
    pub fn from_wire(raw: &[i64]) -> Option<Self> {
        match raw {
            [ballot, proposer] => Some(Round::new(*ballot, *proposer)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.ballot, self.proposer)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScootError {
    #[error("scooter {0} already exists")]
    AlreadyExists(String),
    #[error("scooter {0} not found")]
    NotFound(String),
    #[error("scooter {0} is not available")]
    NotAvailable(String),
    #[error("scooter {0} is not reserved")]
    NotReserved(String),
    #[error("distance must be non-negative, got {0}")]
    NegativeDistance(i64),
    #[error("failed to reach majority in {phase} phase: got {got}, need {need}")]
    NoQuorum {
        phase: &'static str,
        got: usize,
        need: usize,
    },
    #[error("lost the log slot race {attempts} times in a row")]
    SlotContention { attempts: usize },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(String),
}

impl ScootError {
    /// Domain errors are pre-validated at the boundary and defended in the
    /// state machine; they never indicate a replication failure.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            ScootError::AlreadyExists(_)
                | ScootError::NotFound(_)
                | ScootError::NotAvailable(_)
                | ScootError::NotReserved(_)
                | ScootError::NegativeDistance(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_ordering_is_lexicographic() {
        assert!(Round::new(1, 2) > Round::new(1, 1));
        assert!(Round::new(2, 1) > Round::new(1, 99));
        assert!(Round::ZERO < Round::new(0, 1));
        assert_eq!(Round::new(3, 4), Round::new(3, 4));
    }

    #[test]
    fn round_wire_round_trip() {
        let round = Round::new(7, 3);
        assert_eq!(Round::from_wire(&round.to_wire()), Some(round));
        assert_eq!(Round::from_wire(&[]), None);
        assert_eq!(Round::from_wire(&[1, 2, 3]), None);
    }

    #[test]
    fn command_encoding_is_tagged_json() {
        let cmd = ScooterCommand::Reserve {
            scooter_id: "s1".into(),
            reservation_id: "r1".into(),
        };
        let bytes = cmd.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["command_type"], "RESERVE");
        assert_eq!(json["scooter_id"], "s1");
        assert_eq!(ScooterCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn noop_round_trips() {
        let bytes = ScooterCommand::Noop.encode().unwrap();
        assert_eq!(ScooterCommand::decode(&bytes).unwrap(), ScooterCommand::Noop);
    }

    #[test]
    fn malformed_command_is_a_codec_error() {
        let err = ScooterCommand::decode(b"not json").unwrap_err();
        assert!(matches!(err, ScootError::Codec(_)));
        assert!(!err.is_domain());
    }
}
