use keel_cluster::{ClusterInfo, ClusterMember};
use keel_proto::v1::{self, ReadConsistency as ProtoReadConsistency, ResponseHeader};
use keel_types::{
    fields_from_json, fields_to_json, Document, Fields, KeelError, NodeId, ReadConsistency,
};
use tonic::metadata::MetadataValue;
use tonic::Status;

pub const LEADER_ADDR_METADATA: &str = "keel-leader-addr";

pub fn fields_to_bytes(fields: Fields) -> Result<Vec<u8>, Status> {
    serde_json::to_vec(&fields_to_json(fields)).map_err(|e| Status::internal(e.to_string()))
}

/// Empty input is an empty field map.
pub fn fields_from_bytes(bytes: &[u8]) -> Result<Fields, Status> {
    if bytes.is_empty() {
        return Ok(Fields::new());
    }
    let json: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| Status::invalid_argument(format!("invalid fields JSON: {e}")))?;
    fields_from_json(json).ok_or_else(|| Status::invalid_argument("fields must be a JSON object"))
}

pub fn document_to_proto(doc: Document) -> Result<v1::Document, Status> {
    Ok(v1::Document {
        id: doc.id,
        fields_json: fields_to_bytes(doc.fields)?,
        version: doc.version,
        created_at_ns: doc.created_at_ns,
        modified_at_ns: doc.modified_at_ns,
    })
}

pub fn proto_read_consistency(raw: i32) -> ReadConsistency {
    match ProtoReadConsistency::try_from(raw).unwrap_or(ProtoReadConsistency::Local) {
        ProtoReadConsistency::Local => ReadConsistency::Local,
        ProtoReadConsistency::Strong => ReadConsistency::Strong,
    }
}

pub fn header(node_id: NodeId, term: u64, applied_index: Option<u64>) -> ResponseHeader {
    ResponseHeader { node_id, raft_term: term, applied_index: applied_index.unwrap_or(0) }
}

pub fn member_to_proto(member: ClusterMember) -> v1::Member {
    v1::Member {
        node_id: member.node_id,
        name: member.name,
        address: member.address,
        raft_address: member.raft_address,
        state: member.state.to_string(),
    }
}

pub fn cluster_info_to_proto(info: ClusterInfo) -> v1::ClusterStatusResponse {
    v1::ClusterStatusResponse {
        node_id: info.node_id,
        role: info.role.to_string(),
        is_leader: info.is_leader,
        leader_address: info.leader_address.unwrap_or_default(),
        readiness: info.readiness.to_string(),
        alive_members: info.alive_members as u64,
        members: info.members.into_iter().map(member_to_proto).collect(),
        term: info.term,
        last_applied_index: info.last_applied_index,
    }
}

pub fn keel_to_status(err: KeelError) -> Status {
    match &err {
        KeelError::AlreadyExists { .. } => Status::already_exists(err.to_string()),
        KeelError::NotFound { .. } => Status::not_found(err.to_string()),
        KeelError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(addr) = leader {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert(LEADER_ADDR_METADATA, val);
                }
            }
            status
        }
        KeelError::NotReady | KeelError::Unavailable(_) => Status::unavailable(err.to_string()),
        KeelError::LeaderRequired => Status::failed_precondition(err.to_string()),
        KeelError::Timeout => Status::deadline_exceeded(err.to_string()),
        KeelError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        KeelError::Io(_) | KeelError::ApplyFailed(_) | KeelError::Consensus(_) => {
            Status::internal(err.to_string())
        }
    }
}
