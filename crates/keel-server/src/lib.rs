mod admin_service;
pub mod convert;
mod document_service;
pub mod network;
mod raft_service;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use keel_cluster::{DistributedStore, Membership};
use keel_consensus::{ConsensusEngine, KeelRaft};
use keel_proto::v1::{
    admin_service_server::AdminServiceServer, document_service_server::DocumentServiceServer,
    raft_service_server::RaftServiceServer,
};
use tonic_reflection::server::Builder as ReflectionBuilder;

use admin_service::AdminServiceImpl;
use document_service::DocumentServiceImpl;
use raft_service::RaftServiceImpl;

pub use network::GrpcNetwork;

/// Document API for clients.
pub async fn serve_client<C, M>(
    addr: SocketAddr,
    store: Arc<DistributedStore<C, M>>,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()>
where
    C: ConsensusEngine,
    M: Membership,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(keel_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(DocumentServiceServer::new(DocumentServiceImpl::new(store)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}

/// Consensus transport and cluster administration.
pub async fn serve_cluster<C, M>(
    addr: SocketAddr,
    raft: KeelRaft,
    store: Arc<DistributedStore<C, M>>,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()>
where
    C: ConsensusEngine,
    M: Membership,
{
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(keel_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(RaftServiceImpl::new(raft)))
        .add_service(AdminServiceServer::new(AdminServiceImpl::new(store)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
