use keel_consensus::{KeelRaft, TypeConfig};
use keel_proto::v1::{raft_service_server::RaftService, RaftMessage};
use keel_types::NodeId;
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use serde::Serialize;
use tonic::{Request, Response, Status};

/// Inbound consensus RPCs. The reply carries the JSON-encoded `Result` so
/// raft-level rejections reach the caller as remote errors rather than
/// transport failures.
pub struct RaftServiceImpl {
    raft: KeelRaft,
}

impl RaftServiceImpl {
    pub fn new(raft: KeelRaft) -> Self {
        RaftServiceImpl { raft }
    }
}

fn decode<T: serde::de::DeserializeOwned>(request: Request<RaftMessage>) -> Result<T, Status> {
    serde_json::from_slice(&request.into_inner().data)
        .map_err(|e| Status::invalid_argument(e.to_string()))
}

fn reply<T: Serialize>(result: &T) -> Result<Response<RaftMessage>, Status> {
    let data = serde_json::to_vec(result).map_err(|e| Status::internal(e.to_string()))?;
    Ok(Response::new(RaftMessage { data }))
}

#[tonic::async_trait]
impl RaftService for RaftServiceImpl {
    async fn append_entries(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req: AppendEntriesRequest<TypeConfig> = decode(request)?;
        reply(&self.raft.append_entries(req).await)
    }

    async fn vote(&self, request: Request<RaftMessage>) -> Result<Response<RaftMessage>, Status> {
        let req: VoteRequest<NodeId> = decode(request)?;
        reply(&self.raft.vote(req).await)
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req: InstallSnapshotRequest<TypeConfig> = decode(request)?;
        tracing::debug!(
            vote = %req.vote,
            offset = req.offset,
            done = req.done,
            "install snapshot chunk"
        );
        reply(&self.raft.install_snapshot(req).await)
    }
}
