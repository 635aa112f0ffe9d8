use std::sync::Arc;

use keel_cluster::{DistributedStore, Membership};
use keel_consensus::ConsensusEngine;
use keel_proto::v1::{
    admin_service_server::AdminService, ClusterStatusRequest, ClusterStatusResponse,
};
use tonic::{Request, Response, Status};

use crate::convert::cluster_info_to_proto;

pub struct AdminServiceImpl<C, M> {
    store: Arc<DistributedStore<C, M>>,
}

impl<C, M> AdminServiceImpl<C, M> {
    pub fn new(store: Arc<DistributedStore<C, M>>) -> Self {
        AdminServiceImpl { store }
    }
}

#[tonic::async_trait]
impl<C: ConsensusEngine, M: Membership> AdminService for AdminServiceImpl<C, M> {
    /// Served in every readiness state so operators can watch startup.
    async fn cluster_status(
        &self,
        _request: Request<ClusterStatusRequest>,
    ) -> Result<Response<ClusterStatusResponse>, Status> {
        Ok(Response::new(cluster_info_to_proto(self.store.cluster_info())))
    }
}
