use std::sync::Arc;

use keel_cluster::{DistributedStore, Membership};
use keel_consensus::ConsensusEngine;
use keel_proto::v1::{
    document_service_server::DocumentService, CompareAndSwapRequest, CompareAndSwapResponse,
    CountRequest, CountResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    HealthRequest, HealthResponse, InsertRequest, InsertResponse, ListRequest, ListResponse,
    ResponseHeader, UpdateRequest, UpdateResponse,
};
use keel_types::{CasRequest, Document};
use tonic::{Request, Response, Status};

use crate::convert::{
    document_to_proto, fields_from_bytes, fields_to_bytes, header, keel_to_status,
    proto_read_consistency,
};

pub struct DocumentServiceImpl<C, M> {
    store: Arc<DistributedStore<C, M>>,
}

impl<C: ConsensusEngine, M: Membership> DocumentServiceImpl<C, M> {
    pub fn new(store: Arc<DistributedStore<C, M>>) -> Self {
        DocumentServiceImpl { store }
    }

    fn header(&self) -> ResponseHeader {
        let status = self.store.consensus().status();
        header(self.store.consensus().node_id(), status.term, status.last_applied_index)
    }
}

fn require(name: &str, value: &str) -> Result<(), Status> {
    if value.is_empty() {
        return Err(Status::invalid_argument(format!("{name} must not be empty")));
    }
    Ok(())
}

#[tonic::async_trait]
impl<C: ConsensusEngine, M: Membership> DocumentService for DocumentServiceImpl<C, M> {
    async fn insert(
        &self,
        request: Request<InsertRequest>,
    ) -> Result<Response<InsertResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        require("id", &req.id)?;
        let fields = fields_from_bytes(&req.fields_json)?;
        let doc = self
            .store
            .insert(&req.collection, Document::new(req.id, fields))
            .await
            .map_err(keel_to_status)?;
        Ok(Response::new(InsertResponse {
            header: Some(self.header()),
            document: Some(document_to_proto(doc)?),
        }))
    }

    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        require("id", &req.id)?;
        let consistency = proto_read_consistency(req.consistency);
        let doc = self
            .store
            .get_with(&req.collection, &req.id, consistency)
            .await
            .map_err(keel_to_status)?;
        Ok(Response::new(GetResponse {
            header: Some(self.header()),
            document: Some(document_to_proto(doc)?),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        require("id", &req.id)?;
        let fields = fields_from_bytes(&req.fields_json)?;
        let doc = self
            .store
            .update(&req.collection, &req.id, fields)
            .await
            .map_err(keel_to_status)?;
        Ok(Response::new(UpdateResponse {
            header: Some(self.header()),
            document: Some(document_to_proto(doc)?),
        }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        require("id", &req.id)?;
        self.store.delete(&req.collection, &req.id).await.map_err(keel_to_status)?;
        Ok(Response::new(DeleteResponse { header: Some(self.header()) }))
    }

    async fn list(
        &self,
        request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        let consistency = proto_read_consistency(req.consistency);
        let docs = self
            .store
            .list_with(&req.collection, req.limit as usize, req.offset as usize, consistency)
            .await
            .map_err(keel_to_status)?;
        let documents = docs.into_iter().map(document_to_proto).collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(ListResponse { header: Some(self.header()), documents }))
    }

    async fn count(
        &self,
        request: Request<CountRequest>,
    ) -> Result<Response<CountResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        let consistency = proto_read_consistency(req.consistency);
        let count = self
            .store
            .count_with(&req.collection, consistency)
            .await
            .map_err(keel_to_status)?;
        Ok(Response::new(CountResponse { header: Some(self.header()), count: count as u64 }))
    }

    async fn compare_and_swap(
        &self,
        request: Request<CompareAndSwapRequest>,
    ) -> Result<Response<CompareAndSwapResponse>, Status> {
        let req = request.into_inner();
        require("collection", &req.collection)?;
        require("id", &req.id)?;
        let expected = req.expected_json.as_deref().map(fields_from_bytes).transpose()?;
        let cas = CasRequest { key: req.id, expected, value: fields_from_bytes(&req.value_json)? };
        let result =
            self.store.compare_and_swap(&req.collection, cas).await.map_err(keel_to_status)?;
        Ok(Response::new(CompareAndSwapResponse {
            header: Some(self.header()),
            success: result.success,
            current_json: result.current_value.map(fields_to_bytes).transpose()?,
            version: result.version,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        self.store.health().await.map_err(keel_to_status)?;
        Ok(Response::new(HealthResponse {
            readiness: self.store.readiness().to_string(),
            role: self.store.consensus().role().to_string(),
        }))
    }
}
