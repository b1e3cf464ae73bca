use std::collections::BTreeMap;

use tokio::sync::RwLock;

use scoot_types::{LogIndex, Scooter, ScooterCommand, ScootError};

struct MachineInner {
    scooters: BTreeMap<String, Scooter>,
    snapshot_data: Vec<u8>,
    snapshot_index: LogIndex,
}

/// Deterministic interpreter of decided commands.
///
/// Applying the same command sequence on any replica yields the same map;
/// the sorted map also makes the JSON snapshot byte-for-byte reproducible.
/// Reads take the lock shared, apply and snapshot operations take it
/// exclusive.
pub struct ScooterStateMachine {
    inner: RwLock<MachineInner>,
}

impl ScooterStateMachine {
    pub fn new() -> Self {
        ScooterStateMachine {
            inner: RwLock::new(MachineInner {
                scooters: BTreeMap::new(),
                snapshot_data: Vec::new(),
                snapshot_index: 0,
            }),
        }
    }

    /// Decode and apply one command. A domain error leaves the map
    /// untouched; the slot that carried the command stays committed either
    /// way, so callers must not treat this as a replication failure.
    pub async fn apply(&self, command_bytes: &[u8]) -> Result<(), ScootError> {
        let cmd = ScooterCommand::decode(command_bytes)?;

        let mut g = self.inner.write().await;
        match cmd {
            ScooterCommand::Create { scooter_id } => {
                if g.scooters.contains_key(&scooter_id) {
                    return Err(ScootError::AlreadyExists(scooter_id));
                }
                g.scooters
                    .insert(scooter_id.clone(), Scooter::new(scooter_id));
            }
            ScooterCommand::Reserve {
                scooter_id,
                reservation_id,
            } => {
                let scooter = g
                    .scooters
                    .get_mut(&scooter_id)
                    .ok_or_else(|| ScootError::NotFound(scooter_id.clone()))?;
                if !scooter.is_available {
                    return Err(ScootError::NotAvailable(scooter_id));
                }
                scooter.is_available = false;
                scooter.reservation_id = reservation_id;
            }
            ScooterCommand::Release {
                scooter_id,
                distance,
            } => {
                if distance < 0 {
                    return Err(ScootError::NegativeDistance(distance));
                }
                let scooter = g
                    .scooters
                    .get_mut(&scooter_id)
                    .ok_or_else(|| ScootError::NotFound(scooter_id.clone()))?;
                if scooter.is_available {
                    return Err(ScootError::NotReserved(scooter_id));
                }
                scooter.is_available = true;
                scooter.total_distance += distance as f64;
                scooter.reservation_id = String::new();
            }
            ScooterCommand::Noop => {}
        }
        Ok(())
    }

    pub async fn get_scooter(&self, id: &str) -> Option<Scooter> {
        self.inner.read().await.scooters.get(id).cloned()
    }

    /// Every scooter, in id order.
    pub async fn get_scooters(&self) -> Vec<Scooter> {
        self.inner.read().await.scooters.values().cloned().collect()
    }

    /// Capture a serialization of the full map at logical index `index`.
    pub async fn take_snapshot(&self, index: LogIndex) -> Result<(), ScootError> {
        let mut g = self.inner.write().await;
        let data =
            serde_json::to_vec(&g.scooters).map_err(|e| ScootError::Codec(e.to_string()))?;
        g.snapshot_data = data;
        g.snapshot_index = index;
        Ok(())
    }

    /// Replace the map with the deserialized snapshot contents.
    pub async fn load_snapshot(&self, data: &[u8], index: LogIndex) -> Result<(), ScootError> {
        let scooters: BTreeMap<String, Scooter> =
            serde_json::from_slice(data).map_err(|e| ScootError::Codec(e.to_string()))?;

        let mut g = self.inner.write().await;
        g.scooters = scooters;
        g.snapshot_index = index;
        Ok(())
    }

    /// The last captured snapshot: `(data, index)`. Empty data means no
    /// snapshot has been taken yet.
    pub async fn snapshot(&self) -> (Vec<u8>, LogIndex) {
        let g = self.inner.read().await;
        (g.snapshot_data.clone(), g.snapshot_index)
    }

    pub async fn snapshot_index(&self) -> LogIndex {
        self.inner.read().await.snapshot_index
    }
}

impl Default for ScooterStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
