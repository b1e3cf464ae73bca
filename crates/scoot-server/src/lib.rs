mod api;
mod convert;
mod paxos_service;
mod recovery_service;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic_reflection::server::Builder as ReflectionBuilder;

use scoot_consensus::Acceptor;
use scoot_proto::v1::{log_recovery_server::LogRecoveryServer, paxos_server::PaxosServer};
use scoot_state::{ReplicatedLog, ScooterStateMachine};

pub use api::ApiState;
use paxos_service::PaxosServiceImpl;
use recovery_service::RecoveryServiceImpl;

/// Serve the peer surface (Paxos + LogRecovery) on `addr`.
pub async fn serve_cluster(
    addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    machine: Arc<ScooterStateMachine>,
    log: Arc<ReplicatedLog>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_cluster_on(listener, acceptor, machine, log).await
}

/// Serve the peer surface on an already-bound listener (tests bind to an
/// ephemeral port first and need the address before serving).
pub async fn serve_cluster_on(
    listener: TcpListener,
    acceptor: Arc<Acceptor>,
    machine: Arc<ScooterStateMachine>,
    log: Arc<ReplicatedLog>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(scoot_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tracing::info!(addr = %listener.local_addr()?, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(PaxosServer::new(PaxosServiceImpl::new(acceptor)))
        .add_service(LogRecoveryServer::new(RecoveryServiceImpl::new(machine, log)))
        .add_service(reflection)
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
        .map_err(Into::into)
}

/// Serve the SPA-facing HTTP API on `addr`, one task per connection.
pub async fn serve_api(addr: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http api server starting");
    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(api::handle(state, req).await) }
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %err, "http connection closed with error");
            }
        });
    }
}
