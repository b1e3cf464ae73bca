use std::sync::Arc;

use tonic::{Request, Response, Status};

use scoot_consensus::Acceptor;
use scoot_proto::v1::{
    paxos_server::Paxos, AcceptRequest, AcceptedResponse, CommitRequest, CommitResponse,
    PrepareRequest, PromiseResponse,
};

use crate::convert::wire_round;

/// Exposes the local acceptor on the cluster listener.
pub struct PaxosServiceImpl {
    acceptor: Arc<Acceptor>,
}

impl PaxosServiceImpl {
    pub fn new(acceptor: Arc<Acceptor>) -> Self {
        PaxosServiceImpl { acceptor }
    }
}

#[tonic::async_trait]
impl Paxos for PaxosServiceImpl {
    async fn prepare(
        &self,
        request: Request<PrepareRequest>,
    ) -> Result<Response<PromiseResponse>, Status> {
        let req = request.into_inner();
        let round = wire_round(&req.round)?;
        let promise = self.acceptor.prepare(round, req.instance_id).await;
        Ok(Response::new(PromiseResponse {
            round: promise.round.to_wire(),
            ack: promise.ack,
            last_good_round: promise.last_good_round.to_wire(),
            value: promise.value,
            command: promise.command,
            instance_id: req.instance_id,
        }))
    }

    async fn accept(
        &self,
        request: Request<AcceptRequest>,
    ) -> Result<Response<AcceptedResponse>, Status> {
        let req = request.into_inner();
        let round = wire_round(&req.round)?;
        let ack = self
            .acceptor
            .accept(round, req.value, &req.command, req.instance_id)
            .await;
        Ok(Response::new(AcceptedResponse {
            round: round.to_wire(),
            ack,
        }))
    }

    async fn commit(
        &self,
        request: Request<CommitRequest>,
    ) -> Result<Response<CommitResponse>, Status> {
        let req = request.into_inner();
        self.acceptor
            .commit(req.value, req.instance_id, &req.command)
            .await;
        Ok(Response::new(CommitResponse {}))
    }
}
