use super::state_machine::SetStatus;
use grpc::{
    grove_server::Grove, AppendEntriesRequest, AppendEntriesResponse, GetRequest, GetResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse,
    SetRequest, SetResponse, TakeSnapshotRequest, TakeSnapshotResponse,
};
use tonic::{Request, Response, Status};

pub mod grpc {
    tonic::include_proto!("grovekv");
}

#[tonic::async_trait]
impl Grove for super::GroveNode {
    async fn append_entries(
        &self,
        req: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        match self.append_entries(req.into_inner()).await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(err) => Err(Status::internal(format!("appending entries: {err:#}"))),
        }
    }

    async fn request_vote(
        &self,
        req: Request<RequestVoteRequest>,
    ) -> Result<Response<RequestVoteResponse>, Status> {
        match self.request_vote(req.into_inner()).await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(err) => Err(Status::internal(format!("requesting vote: {err:#}"))),
        }
    }

    async fn install_snapshot(
        &self,
        req: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        match self.install_snapshot(req.into_inner()).await {
            Ok(resp) => Ok(Response::new(resp)),
            Err(err) => Err(Status::internal(format!("installing snapshot: {err:#}"))),
        }
    }

    async fn take_snapshot(
        &self,
        _req: Request<TakeSnapshotRequest>,
    ) -> Result<Response<TakeSnapshotResponse>, Status> {
        match self.take_snapshot().await {
            Ok(()) => Ok(Response::new(TakeSnapshotResponse { success: true })),
            Err(_) => Ok(Response::new(TakeSnapshotResponse { success: false })),
        }
    }

    async fn get(&self, req: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        match self.get(req.into_inner().key).await {
            Ok(Some(value)) => Ok(Response::new(GetResponse { value, found: true })),
            Ok(None) => Ok(Response::new(GetResponse {
                value: String::new(),
                found: false,
            })),
            Err(err) => Err(Status::internal(format!("getting key: {err:#}"))),
        }
    }

    async fn set(&self, req: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        let req = req.into_inner();
        match self.set(req.key, req.value).await {
            Ok(SetStatus::Applied) => Ok(Response::new(SetResponse {
                success: true,
                error: String::new(),
                leader_id: String::new(),
            })),
            // the CLI matches this error string to decide whether to redirect
            Ok(SetStatus::NotLeader { leader_hint }) => Ok(Response::new(SetResponse {
                success: false,
                error: "not leader".to_string(),
                leader_id: leader_hint.unwrap_or_else(|| "unknown".to_string()),
            })),
            Ok(SetStatus::Failed(msg)) => Ok(Response::new(SetResponse {
                success: false,
                error: msg,
                leader_id: String::new(),
            })),
            Err(err) => Err(Status::internal(format!("setting key: {err:#}"))),
        }
    }
}
