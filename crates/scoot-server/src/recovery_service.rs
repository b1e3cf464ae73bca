use std::sync::Arc;

use tonic::{Request, Response, Status};

use scoot_consensus::recovery;
use scoot_proto::v1::{log_recovery_server::LogRecovery, GetLogRequest, GetLogResponse};
use scoot_state::{ReplicatedLog, ScooterStateMachine};

/// Serves the snapshot + log suffix to peers catching up.
pub struct RecoveryServiceImpl {
    machine: Arc<ScooterStateMachine>,
    log: Arc<ReplicatedLog>,
}

impl RecoveryServiceImpl {
    pub fn new(machine: Arc<ScooterStateMachine>, log: Arc<ReplicatedLog>) -> Self {
        RecoveryServiceImpl { machine, log }
    }
}

#[tonic::async_trait]
impl LogRecovery for RecoveryServiceImpl {
    async fn get_log(
        &self,
        request: Request<GetLogRequest>,
    ) -> Result<Response<GetLogResponse>, Status> {
        let req = request.into_inner();
        let bundle = recovery::collect_log(&self.machine, &self.log, req.starting_index).await;
        Ok(Response::new(bundle.into_wire()))
    }
}
