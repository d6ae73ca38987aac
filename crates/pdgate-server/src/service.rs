//! PD gRPC service.
//!
//! Implements the `PD` interface on top of the guard, bootstrap gate,
//! lifecycle gate and collaborators. Unary handlers return
//! `GatewayResult`; [`Gateway::reply`] envelopes them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use pdgate_state::ClusterStore;

use crate::alloc::{BatchIdAllocator, IdAllocator, LocalTso, TsoAllocator};
use crate::bootstrap::BootstrapGate;
use crate::cluster::{ClusterState, NoopScheduler, Scheduler, StoreCluster};
use crate::config::{HeartbeatConfig, ServerConfig};
use crate::convert;
use crate::error::{GatewayError, GatewayResult};
use crate::guard::{ClusterGuard, Leadership};
use crate::header::{Envelope, HeaderBuilder};
use crate::heartbeat::{HeartbeatMux, HeartbeatStream};
use crate::lifecycle;
use crate::proto;
use crate::proto::pd_server::{Pd, PdServer};
use crate::tso;
use crate::watch::WatchRegistry;

/// Everything a [`Gateway`] is assembled from.
pub struct GatewayParts {
    pub guard: ClusterGuard,
    pub cluster: Arc<dyn ClusterState>,
    pub scheduler: Arc<dyn Scheduler>,
    pub ids: Arc<dyn IdAllocator>,
    pub tso: Arc<dyn TsoAllocator>,
    pub members: Vec<proto::Member>,
    pub heartbeat: HeartbeatConfig,
    /// Server-wide shutdown; every stream runs under a child of it.
    pub shutdown: CancellationToken,
}

/// gRPC implementation of the PD service.
pub struct Gateway {
    guard: ClusterGuard,
    headers: HeaderBuilder,
    gate: Arc<BootstrapGate>,
    cluster: Arc<dyn ClusterState>,
    ids: Arc<dyn IdAllocator>,
    tso: Arc<dyn TsoAllocator>,
    heartbeats: HeartbeatMux,
    members: Vec<proto::Member>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        let gate = Arc::new(BootstrapGate::new(parts.cluster.clone()));
        let registry = WatchRegistry::new(parts.heartbeat.subscription_buffer);
        let heartbeats = HeartbeatMux::new(
            parts.guard.clone(),
            gate.clone(),
            parts.cluster.clone(),
            parts.scheduler,
            parts.ids.clone(),
            registry,
            parts.heartbeat,
            parts.shutdown.clone(),
        );
        Self {
            headers: HeaderBuilder::new(parts.guard.cluster_id()),
            guard: parts.guard,
            gate,
            cluster: parts.cluster,
            ids: parts.ids,
            tso: parts.tso,
            heartbeats,
            members: parts.members,
            shutdown: parts.shutdown,
        }
    }

    /// Wire the reference collaborators over one cluster store.
    pub fn from_config(
        config: &ServerConfig,
        store: ClusterStore,
        cluster_id: u64,
        leadership: Leadership,
        shutdown: CancellationToken,
    ) -> GatewayResult<Self> {
        let ids: Arc<dyn IdAllocator> =
            Arc::new(BatchIdAllocator::new(store.clone(), config.alloc_step)?);
        let tso = Arc::new(LocalTso::new(
            store.clone(),
            Duration::from_millis(config.tso_save_interval_ms),
        )?);
        let cluster = StoreCluster::new(store, ids.clone(), cluster_id)
            .with_max_peer_count(config.max_peer_count);

        info!(cluster_id, member_id = leadership.member_id(), "gateway assembled");
        Ok(Self::new(GatewayParts {
            guard: ClusterGuard::new(cluster_id, leadership),
            cluster: Arc::new(cluster),
            scheduler: Arc::new(NoopScheduler),
            ids,
            tso,
            members: config.members(),
            heartbeat: config.heartbeat.clone(),
            shutdown,
        }))
    }

    pub fn cluster_id(&self) -> u64 {
        self.guard.cluster_id()
    }

    pub fn registry(&self) -> &WatchRegistry {
        self.heartbeats.registry()
    }

    /// The region heartbeat multiplexer, for driving streams without a
    /// transport.
    pub fn heartbeats(&self) -> &HeartbeatMux {
        &self.heartbeats
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> PdServer<Self> {
        PdServer::new(self)
    }

    fn reply<R: Envelope>(&self, result: GatewayResult<R>) -> Result<Response<R>, Status> {
        self.headers.wrap(result).map(Response::new)
    }

    fn check(&self, header: Option<&proto::RequestHeader>) -> GatewayResult<()> {
        self.guard.validate(header)
    }

    async fn handle_get_members(
        &self,
        _req: proto::GetMembersRequest,
    ) -> GatewayResult<proto::GetMembersResponse> {
        let leader_id = self
            .guard
            .leadership()
            .leader_id()
            .ok_or(GatewayError::NotStarted)?;
        let leader = self
            .members
            .iter()
            .find(|m| m.member_id == leader_id)
            .cloned()
            .ok_or(GatewayError::NotStarted)?;
        Ok(proto::GetMembersResponse {
            members: self.members.clone(),
            leader: Some(leader),
            ..Default::default()
        })
    }

    async fn handle_bootstrap(
        &self,
        req: proto::BootstrapRequest,
    ) -> GatewayResult<proto::BootstrapResponse> {
        self.check(req.header.as_ref())?;
        let store = req
            .store
            .as_ref()
            .map(convert::store_from_proto)
            .ok_or_else(|| invalid("missing bootstrap store"))?;
        let region = req
            .region
            .as_ref()
            .map(convert::region_from_proto)
            .ok_or_else(|| invalid("missing bootstrap region"))?;

        self.gate.bootstrap(store, region).await?;
        Ok(proto::BootstrapResponse::default())
    }

    async fn handle_is_bootstrapped(
        &self,
        req: proto::IsBootstrappedRequest,
    ) -> GatewayResult<proto::IsBootstrappedResponse> {
        self.check(req.header.as_ref())?;
        Ok(proto::IsBootstrappedResponse {
            bootstrapped: self.gate.is_bootstrapped().await?,
            ..Default::default()
        })
    }

    async fn handle_alloc_id(
        &self,
        req: proto::AllocIdRequest,
    ) -> GatewayResult<proto::AllocIdResponse> {
        self.check(req.header.as_ref())?;
        let id = self.ids.alloc()?;
        debug!(id, "id allocated");
        Ok(proto::AllocIdResponse {
            id,
            ..Default::default()
        })
    }

    async fn handle_get_store(
        &self,
        req: proto::GetStoreRequest,
    ) -> GatewayResult<proto::GetStoreResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let store = self
            .cluster
            .get_store(req.store_id)?
            .ok_or_else(|| invalid(format!("invalid store ID {}, not found", req.store_id)))?;
        Ok(proto::GetStoreResponse {
            store: Some(convert::store_to_proto(&store)),
            ..Default::default()
        })
    }

    async fn handle_put_store(
        &self,
        req: proto::PutStoreRequest,
    ) -> GatewayResult<proto::PutStoreResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let store = req
            .store
            .as_ref()
            .map(convert::store_from_proto)
            .ok_or_else(|| invalid("missing store"))?;
        lifecycle::check_store(self.cluster.as_ref(), store.id)?;

        let (store_id, address) = (store.id, store.address.clone());
        self.cluster.put_store(store)?;
        info!(store_id, %address, "store registered");
        Ok(proto::PutStoreResponse::default())
    }

    async fn handle_store_heartbeat(
        &self,
        req: proto::StoreHeartbeatRequest,
    ) -> GatewayResult<proto::StoreHeartbeatResponse> {
        self.check(req.header.as_ref())?;
        let stats = req
            .stats
            .as_ref()
            .map(convert::stats_from_proto)
            .ok_or_else(|| invalid("invalid store heartbeat command"))?;
        self.gate.require_bootstrapped().await?;
        lifecycle::check_store(self.cluster.as_ref(), stats.store_id)?;

        self.cluster.handle_store_heartbeat(stats)?;
        Ok(proto::StoreHeartbeatResponse::default())
    }

    async fn handle_get_region(
        &self,
        req: proto::GetRegionRequest,
    ) -> GatewayResult<proto::GetRegionResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let info = self.cluster.get_region_by_key(&req.region_key)?;
        Ok(region_response(info))
    }

    async fn handle_get_region_by_id(
        &self,
        req: proto::GetRegionByIdRequest,
    ) -> GatewayResult<proto::GetRegionResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let info = self.cluster.get_region_by_id(req.region_id)?;
        Ok(region_response(info))
    }

    async fn handle_ask_split(
        &self,
        req: proto::AskSplitRequest,
    ) -> GatewayResult<proto::AskSplitResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let region = req
            .region
            .as_ref()
            .map(convert::region_from_proto)
            .ok_or_else(|| invalid("missing region start key for split"))?;
        let ids = self.cluster.ask_split(&region)?;
        Ok(proto::AskSplitResponse {
            new_region_id: ids.new_region_id,
            new_peer_ids: ids.new_peer_ids,
            ..Default::default()
        })
    }

    async fn handle_report_split(
        &self,
        req: proto::ReportSplitRequest,
    ) -> GatewayResult<proto::ReportSplitResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let (Some(left), Some(right)) = (req.left.as_ref(), req.right.as_ref()) else {
            return Err(invalid("split report needs both regions"));
        };
        self.cluster.report_split(
            convert::region_from_proto(left),
            convert::region_from_proto(right),
        )?;
        Ok(proto::ReportSplitResponse::default())
    }

    async fn handle_get_cluster_config(
        &self,
        req: proto::GetClusterConfigRequest,
    ) -> GatewayResult<proto::GetClusterConfigResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let config = self.cluster.get_config()?;
        Ok(proto::GetClusterConfigResponse {
            cluster: Some(convert::config_to_proto(&config)),
            ..Default::default()
        })
    }

    async fn handle_put_cluster_config(
        &self,
        req: proto::PutClusterConfigRequest,
    ) -> GatewayResult<proto::PutClusterConfigResponse> {
        self.check(req.header.as_ref())?;
        self.gate.require_bootstrapped().await?;

        let config = req
            .cluster
            .as_ref()
            .map(convert::config_from_proto)
            .ok_or_else(|| invalid("missing cluster config"))?;
        let max_peer_count = config.max_peer_count;
        self.cluster.put_config(config)?;
        info!(max_peer_count, "cluster config updated");
        Ok(proto::PutClusterConfigResponse::default())
    }
}

fn invalid(msg: impl Into<String>) -> GatewayError {
    GatewayError::InvalidRequest(msg.into())
}

fn region_response(info: Option<pdgate_state::RegionInfo>) -> proto::GetRegionResponse {
    match info {
        Some(info) => proto::GetRegionResponse {
            region: Some(convert::region_to_proto(&info.region)),
            leader: info.leader.as_ref().map(convert::peer_to_proto),
            ..Default::default()
        },
        None => proto::GetRegionResponse::default(),
    }
}

#[tonic::async_trait]
impl Pd for Gateway {
    async fn get_members(
        &self,
        request: Request<proto::GetMembersRequest>,
    ) -> Result<Response<proto::GetMembersResponse>, Status> {
        self.reply(self.handle_get_members(request.into_inner()).await)
    }

    type TsoStream = tso::TsoStream;

    async fn tso(
        &self,
        request: Request<Streaming<proto::TsoRequest>>,
    ) -> Result<Response<Self::TsoStream>, Status> {
        Ok(Response::new(tso::open(
            self.guard.clone(),
            self.tso.clone(),
            request.into_inner(),
            self.shutdown.clone(),
        )))
    }

    async fn bootstrap(
        &self,
        request: Request<proto::BootstrapRequest>,
    ) -> Result<Response<proto::BootstrapResponse>, Status> {
        self.reply(self.handle_bootstrap(request.into_inner()).await)
    }

    async fn is_bootstrapped(
        &self,
        request: Request<proto::IsBootstrappedRequest>,
    ) -> Result<Response<proto::IsBootstrappedResponse>, Status> {
        self.reply(self.handle_is_bootstrapped(request.into_inner()).await)
    }

    async fn alloc_id(
        &self,
        request: Request<proto::AllocIdRequest>,
    ) -> Result<Response<proto::AllocIdResponse>, Status> {
        self.reply(self.handle_alloc_id(request.into_inner()).await)
    }

    async fn get_store(
        &self,
        request: Request<proto::GetStoreRequest>,
    ) -> Result<Response<proto::GetStoreResponse>, Status> {
        self.reply(self.handle_get_store(request.into_inner()).await)
    }

    async fn put_store(
        &self,
        request: Request<proto::PutStoreRequest>,
    ) -> Result<Response<proto::PutStoreResponse>, Status> {
        self.reply(self.handle_put_store(request.into_inner()).await)
    }

    async fn store_heartbeat(
        &self,
        request: Request<proto::StoreHeartbeatRequest>,
    ) -> Result<Response<proto::StoreHeartbeatResponse>, Status> {
        self.reply(self.handle_store_heartbeat(request.into_inner()).await)
    }

    type RegionHeartbeatStream = HeartbeatStream;

    async fn region_heartbeat(
        &self,
        request: Request<Streaming<proto::RegionHeartbeatRequest>>,
    ) -> Result<Response<Self::RegionHeartbeatStream>, Status> {
        Ok(Response::new(self.heartbeats.open(request.into_inner())))
    }

    async fn get_region(
        &self,
        request: Request<proto::GetRegionRequest>,
    ) -> Result<Response<proto::GetRegionResponse>, Status> {
        self.reply(self.handle_get_region(request.into_inner()).await)
    }

    async fn get_region_by_id(
        &self,
        request: Request<proto::GetRegionByIdRequest>,
    ) -> Result<Response<proto::GetRegionResponse>, Status> {
        self.reply(self.handle_get_region_by_id(request.into_inner()).await)
    }

    async fn ask_split(
        &self,
        request: Request<proto::AskSplitRequest>,
    ) -> Result<Response<proto::AskSplitResponse>, Status> {
        self.reply(self.handle_ask_split(request.into_inner()).await)
    }

    async fn report_split(
        &self,
        request: Request<proto::ReportSplitRequest>,
    ) -> Result<Response<proto::ReportSplitResponse>, Status> {
        self.reply(self.handle_report_split(request.into_inner()).await)
    }

    async fn get_cluster_config(
        &self,
        request: Request<proto::GetClusterConfigRequest>,
    ) -> Result<Response<proto::GetClusterConfigResponse>, Status> {
        self.reply(self.handle_get_cluster_config(request.into_inner()).await)
    }

    async fn put_cluster_config(
        &self,
        request: Request<proto::PutClusterConfigRequest>,
    ) -> Result<Response<proto::PutClusterConfigResponse>, Status> {
        self.reply(self.handle_put_cluster_config(request.into_inner()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_ID: u64 = 7;

    fn gateway(leader: Option<u64>) -> Gateway {
        let config = ServerConfig {
            name: "pd1".to_string(),
            member_id: 1,
            ..Default::default()
        };
        let leadership = Leadership::new(1);
        if let Some(id) = leader {
            leadership.set_leader(id);
        }
        Gateway::from_config(
            &config,
            ClusterStore::open_in_memory().unwrap(),
            CLUSTER_ID,
            leadership,
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn header() -> Option<proto::RequestHeader> {
        Some(proto::RequestHeader {
            cluster_id: CLUSTER_ID,
        })
    }

    #[tokio::test]
    async fn get_members_reports_leader() {
        let gw = gateway(Some(1));
        let resp = gw
            .get_members(Request::new(proto::GetMembersRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.members.len(), 1);
        assert_eq!(resp.leader.unwrap().name, "pd1");
        assert_eq!(resp.header.unwrap().cluster_id, CLUSTER_ID);
    }

    #[tokio::test]
    async fn get_members_without_leader_is_unavailable() {
        let gw = gateway(None);
        let status = gw
            .get_members(Request::new(proto::GetMembersRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn follower_rejects_requests() {
        let gw = gateway(Some(2));
        let status = gw
            .alloc_id(Request::new(proto::AllocIdRequest { header: header() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn alloc_id_does_not_need_bootstrap() {
        let gw = gateway(Some(1));
        let first = gw
            .alloc_id(Request::new(proto::AllocIdRequest { header: header() }))
            .await
            .unwrap()
            .into_inner();
        let second = gw
            .alloc_id(Request::new(proto::AllocIdRequest { header: header() }))
            .await
            .unwrap()
            .into_inner();
        assert!(second.id > first.id);
        assert!(first.header.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn bootstrap_without_region_is_malformed() {
        let gw = gateway(Some(1));
        let status = gw
            .bootstrap(Request::new(proto::BootstrapRequest {
                header: header(),
                store: Some(proto::Store {
                    id: 1,
                    ..Default::default()
                }),
                region: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn store_heartbeat_without_stats_is_malformed() {
        let gw = gateway(Some(1));
        let status = gw
            .store_heartbeat(Request::new(proto::StoreHeartbeatRequest {
                header: header(),
                stats: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
