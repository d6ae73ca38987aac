//! Region heartbeat stream multiplexer.
//!
//! One bidirectional stream per storage node. Two tasks share it:
//!
//! - the **receive loop** validates and ingests each inbound heartbeat and
//!   routes any resulting instruction through the [`WatchRegistry`];
//! - the **pusher** drains the stream's own subscription and writes each
//!   instruction to the outbound half, one at a time, reporting the outcome
//!   on the instruction's ack slot once the transport has taken it.
//!
//! The outbound half holds a single response, so at most one instruction
//! per stream is in flight. The receive loop waits only for acks of
//! instructions addressed to its own subscription.
//!
//! Both run under one cancellation scope (a child of the server shutdown
//! token). Whichever side ends first cancels the scope; the receive loop
//! then joins the pusher, so the subscription is released before the
//! response stream closes.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use pdgate_state::RegionInfo;

use crate::alloc::IdAllocator;
use crate::bootstrap::BootstrapGate;
use crate::cluster::{ClusterState, Scheduler};
use crate::config::{HeartbeatConfig, HeartbeatMode};
use crate::convert;
use crate::error::GatewayError;
use crate::guard::ClusterGuard;
use crate::header::HeaderBuilder;
use crate::proto;
use crate::watch::{
    Ack, DeliveryError, DeliveryResult, SubscriberKey, Subscription, WatchRegistry,
};

type Outbound = mpsc::Sender<Result<proto::RegionHeartbeatResponse, Status>>;

/// The response half handed back to the transport.
pub type HeartbeatStream = ReceiverStream<Result<proto::RegionHeartbeatResponse, Status>>;

/// Per-stream lifecycle. Subscription registration happens only on the
/// `AwaitingFirst` → `Active` edge.
enum SessionState {
    AwaitingFirst,
    Active(ActiveSession),
    Terminated,
}

struct ActiveSession {
    key: SubscriberKey,
    pusher: JoinHandle<()>,
}

/// Serves `RegionHeartbeat` streams.
#[derive(Clone)]
pub struct HeartbeatMux {
    guard: ClusterGuard,
    headers: HeaderBuilder,
    gate: Arc<BootstrapGate>,
    cluster: Arc<dyn ClusterState>,
    scheduler: Arc<dyn Scheduler>,
    ids: Arc<dyn IdAllocator>,
    registry: WatchRegistry,
    config: HeartbeatConfig,
    shutdown: CancellationToken,
}

impl HeartbeatMux {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guard: ClusterGuard,
        gate: Arc<BootstrapGate>,
        cluster: Arc<dyn ClusterState>,
        scheduler: Arc<dyn Scheduler>,
        ids: Arc<dyn IdAllocator>,
        registry: WatchRegistry,
        config: HeartbeatConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            headers: HeaderBuilder::new(guard.cluster_id()),
            guard,
            gate,
            cluster,
            scheduler,
            ids,
            registry,
            config,
            shutdown,
        }
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    /// Start serving one stream and return its response half.
    ///
    /// A fatal error is delivered as the final `Err` item; a clean
    /// client close or cancellation just ends the stream.
    pub fn open<S>(&self, inbound: S) -> HeartbeatStream
    where
        S: Stream<Item = Result<proto::RegionHeartbeatRequest, Status>> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(1);
        let mux = self.clone();
        tokio::spawn(async move {
            if let Err(status) = mux.run(inbound, &tx).await {
                let _ = tx.send(Err(status)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    async fn run<S>(&self, mut inbound: S, out: &Outbound) -> Result<(), Status>
    where
        S: Stream<Item = Result<proto::RegionHeartbeatRequest, Status>> + Unpin,
    {
        let scope = self.shutdown.child_token();
        let (errors_tx, mut errors_rx) = mpsc::channel::<Status>(1);
        let mut state = SessionState::AwaitingFirst;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                Some(status) = errors_rx.recv() => break Err(status),
                _ = scope.cancelled() => break Ok(()),
                _ = out.closed() => break Ok(()),
                next = inbound.next() => next,
            };
            let request = match next {
                None => break Ok(()),
                Some(Err(status)) => break Err(status),
                Some(Ok(request)) => request,
            };

            if matches!(state, SessionState::AwaitingFirst) {
                match self.activate(&request, out, &scope, &errors_tx) {
                    Ok(active) => state = SessionState::Active(active),
                    Err(status) => break Err(status),
                }
            }
            if let SessionState::Active(active) = &state {
                self.handle_message(&request, active.key, &scope).await;
            }
        };

        scope.cancel();
        if let SessionState::Active(active) = std::mem::replace(&mut state, SessionState::Terminated)
        {
            let _ = active.pusher.await;
            info!(key = %active.key, ok = outcome.is_ok(), "region heartbeat stream closed");
        }
        // A pusher failure may race a clean exit of the receive loop.
        match (outcome, errors_rx.try_recv()) {
            (Ok(()), Ok(status)) => Err(status),
            (outcome, _) => outcome,
        }
    }

    /// First-message setup: guard check, subscription, pusher.
    fn activate(
        &self,
        request: &proto::RegionHeartbeatRequest,
        out: &Outbound,
        scope: &CancellationToken,
        errors: &mpsc::Sender<Status>,
    ) -> Result<ActiveSession, Status> {
        self.guard
            .validate(request.header.as_ref())
            .map_err(GatewayError::into_status)?;

        let store_id = request.leader.as_ref().map_or(0, |p| p.store_id);
        let subscriber_id = self.ids.alloc().map_err(GatewayError::into_status)?;
        let subscription = self
            .registry
            .subscribe(store_id, subscriber_id)
            .map_err(|e| Status::already_exists(e.to_string()))?;
        let key = subscription.key();

        let pusher = tokio::spawn(push_loop(
            subscription,
            out.clone(),
            self.headers,
            scope.clone(),
            errors.clone(),
        ));
        info!(%key, "region heartbeat stream opened");
        Ok(ActiveSession { key, pusher })
    }

    /// Process one heartbeat. Never fatal: failures become an error
    /// instruction pushed back on this stream.
    async fn handle_message(
        &self,
        request: &proto::RegionHeartbeatRequest,
        key: SubscriberKey,
        scope: &CancellationToken,
    ) {
        let region = convert::region_info_from_heartbeat(request);

        let ack = match self.process(&region).await {
            Ok(Some(instruction)) => {
                self.registry
                    .publish(&region, instruction, &key, scope)
                    .await
            }
            Ok(None) if self.config.mode == HeartbeatMode::Unary => {
                let reply = proto::RegionHeartbeatResponse {
                    header: Some(self.headers.ok()),
                    region_id: region.id(),
                    ..Default::default()
                };
                self.registry.send_to(&key, reply, scope).await
            }
            Ok(None) => return,
            Err(message) => {
                warn!(%key, region_id = region.id(), %message, "region heartbeat rejected");
                let reply = self
                    .headers
                    .error_instruction(proto::ErrorType::Unknown, message);
                self.registry.send_to(&key, reply, scope).await
            }
        };
        if let Some(ack) = ack {
            await_delivery(ack, scope).await;
        }
    }

    /// Validate, ingest and schedule. The error is the message reported
    /// back to the store.
    async fn process(
        &self,
        region: &RegionInfo,
    ) -> Result<Option<proto::RegionHeartbeatResponse>, String> {
        if !self.gate.is_bootstrapped().await.map_err(|e| e.to_string())? {
            return Err(GatewayError::NotBootstrapped.to_string());
        }
        if region.id() == 0 {
            return Err(format!("invalid request region, {:?}", region.region));
        }
        if region.leader.is_none() {
            return Err(format!("invalid request leader, region {}", region.id()));
        }

        self.cluster
            .ingest_region_heartbeat(region)
            .map_err(|e| e.to_string())?;
        self.scheduler
            .on_region_heartbeat(region)
            .map_err(|e| e.to_string())
    }
}

/// Wait for this stream's own ack, giving up if its scope ends first.
async fn await_delivery(ack: Ack, scope: &CancellationToken) {
    tokio::select! {
        _ = scope.cancelled() => {}
        outcome = ack.wait() => {
            if let Err(e) = outcome {
                debug!(error = %e, "instruction not delivered");
            }
        }
    }
}

/// Write one response, then wait until the transport has taken it: the
/// single outbound slot frees only once the response is read.
async fn deliver(out: &Outbound, response: proto::RegionHeartbeatResponse) -> DeliveryResult {
    let closed = || DeliveryError::WriteFailed("response stream closed".to_string());
    out.send(Ok(response)).await.map_err(|_| closed())?;
    drop(out.reserve().await.map_err(|_| closed())?);
    Ok(())
}

/// Drain the subscription into the outbound half, one instruction at a
/// time. A failed write is reported on the error channel and tears the
/// stream down; the instruction is not retried.
async fn push_loop(
    mut subscription: Subscription,
    out: Outbound,
    headers: HeaderBuilder,
    scope: CancellationToken,
    errors: mpsc::Sender<Status>,
) {
    let key = subscription.key();
    let failure = loop {
        let request = tokio::select! {
            biased;
            _ = scope.cancelled() => break None,
            _ = out.closed() => break None,
            next = subscription.recv() => match next {
                Some(request) => request,
                None => break Some(Status::unavailable("operator subscription closed")),
            },
        };

        let (mut response, ack) = request.into_parts();
        if response.header.is_none() {
            response.header = Some(headers.ok());
        }
        let sent = tokio::select! {
            _ = scope.cancelled() => None,
            sent = deliver(&out, response) => Some(sent),
        };
        match sent {
            Some(Ok(())) => {
                debug!(%key, "instruction pushed");
                ack.report(Ok(()));
            }
            Some(Err(e)) => {
                ack.report(Err(e));
                break Some(Status::aborted("failed to push region heartbeat response"));
            }
            None => {
                ack.report(Err(DeliveryError::Dropped));
                break None;
            }
        }
    };

    drop(subscription);
    if let Some(status) = failure {
        warn!(%key, error = %status.message(), "region heartbeat push failed");
        let _ = errors.try_send(status);
    }
    scope.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::sync::Mutex;
    use std::time::Duration;

    use pdgate_state::{ClusterStore, Peer, Region, Store};
    use tokio_stream::wrappers::ReceiverStream;

    use crate::alloc::BatchIdAllocator;
    use crate::cluster::{NoopScheduler, StoreCluster};
    use crate::error::GatewayResult;
    use crate::guard::Leadership;

    const CLUSTER_ID: u64 = 42;

    /// Issues one transfer-leader instruction per heartbeat.
    struct EchoScheduler {
        seen: Mutex<Vec<u64>>,
    }

    impl Scheduler for EchoScheduler {
        fn on_region_heartbeat(
            &self,
            region: &RegionInfo,
        ) -> GatewayResult<Option<proto::RegionHeartbeatResponse>> {
            self.seen.lock().unwrap().push(region.id());
            Ok(Some(proto::RegionHeartbeatResponse {
                region_id: region.id(),
                transfer_leader: Some(proto::TransferLeader {
                    peer: Some(proto::Peer { id: 99, store_id: 2 }),
                }),
                ..Default::default()
            }))
        }
    }

    fn mux_with(scheduler: Arc<dyn Scheduler>, mode: HeartbeatMode) -> HeartbeatMux {
        let store = ClusterStore::open_in_memory().unwrap();
        let ids = Arc::new(BatchIdAllocator::new(store.clone(), 100).unwrap());
        let cluster: Arc<dyn ClusterState> =
            Arc::new(StoreCluster::new(store, ids.clone(), CLUSTER_ID));
        cluster
            .bootstrap(
                Store {
                    id: 1,
                    address: "10.0.0.1:20160".to_string(),
                    ..Default::default()
                },
                Region {
                    id: 2,
                    peers: vec![Peer { id: 3, store_id: 1 }],
                    ..Default::default()
                },
            )
            .unwrap();

        let leadership = Leadership::new(1);
        leadership.set_leader(1);
        HeartbeatMux::new(
            ClusterGuard::new(CLUSTER_ID, leadership),
            Arc::new(BootstrapGate::new(cluster.clone())),
            cluster,
            scheduler,
            ids,
            WatchRegistry::new(8),
            HeartbeatConfig {
                mode,
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }

    fn heartbeat(region_id: u64, leader_store: Option<u64>) -> proto::RegionHeartbeatRequest {
        proto::RegionHeartbeatRequest {
            header: Some(proto::RequestHeader {
                cluster_id: CLUSTER_ID,
            }),
            region: Some(proto::Region {
                id: region_id,
                ..Default::default()
            }),
            leader: leader_store.map(|store_id| proto::Peer {
                id: region_id * 10,
                store_id,
            }),
            ..Default::default()
        }
    }

    type Inbound = mpsc::Sender<Result<proto::RegionHeartbeatRequest, Status>>;

    fn connect(mux: &HeartbeatMux) -> (Inbound, HeartbeatStream) {
        let (tx, rx) = mpsc::channel(8);
        let responses = mux.open(ReceiverStream::new(rx));
        (tx, responses)
    }

    #[tokio::test]
    async fn malformed_region_gets_unknown_error_and_stream_survives() {
        let mux = mux_with(Arc::new(NoopScheduler), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        tx.send(Ok(heartbeat(0, Some(1)))).await.unwrap();
        let resp = responses.next().await.unwrap().unwrap();
        let err = resp.header.unwrap().error.unwrap();
        assert_eq!(err.r#type(), proto::ErrorType::Unknown);
        assert!(err.message.contains("invalid request region"));

        tx.send(Ok(heartbeat(5, None))).await.unwrap();
        let resp = responses.next().await.unwrap().unwrap();
        assert!(resp.header.unwrap().error.unwrap().message.contains("leader"));

        drop(tx);
        assert!(responses.next().await.is_none());
    }

    #[tokio::test]
    async fn scheduler_instruction_is_pushed_with_header() {
        let scheduler = Arc::new(EchoScheduler {
            seen: Mutex::new(Vec::new()),
        });
        let mux = mux_with(scheduler.clone(), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        tx.send(Ok(heartbeat(7, Some(1)))).await.unwrap();
        let resp = responses.next().await.unwrap().unwrap();
        assert_eq!(resp.region_id, 7);
        assert!(resp.transfer_leader.is_some());
        let header = resp.header.unwrap();
        assert_eq!(header.cluster_id, CLUSTER_ID);
        assert!(header.error.is_none());
        assert_eq!(*scheduler.seen.lock().unwrap(), vec![7]);

        drop(tx);
        assert!(responses.next().await.is_none());
    }

    #[tokio::test]
    async fn unary_mode_replies_to_every_heartbeat() {
        let mux = mux_with(Arc::new(NoopScheduler), HeartbeatMode::Unary);
        let (tx, mut responses) = connect(&mux);

        for region_id in [2, 2] {
            tx.send(Ok(heartbeat(region_id, Some(1)))).await.unwrap();
            let resp = responses.next().await.unwrap().unwrap();
            assert_eq!(resp.region_id, 2);
            assert!(resp.header.unwrap().error.is_none());
        }
    }

    #[tokio::test]
    async fn guard_failure_on_first_message_is_fatal() {
        let mux = mux_with(Arc::new(NoopScheduler), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        let mut req = heartbeat(7, Some(1));
        req.header = Some(proto::RequestHeader { cluster_id: 1 });
        tx.send(Ok(req)).await.unwrap();

        let status = responses.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(responses.next().await.is_none());
        assert_eq!(mux.registry().subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn receive_error_is_propagated_and_subscription_released() {
        let mux = mux_with(Arc::new(NoopScheduler), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        tx.send(Ok(heartbeat(0, Some(1)))).await.unwrap();
        responses.next().await.unwrap().unwrap();
        assert_eq!(mux.registry().subscriber_count(1), 1);

        tx.send(Err(Status::data_loss("broken pipe"))).await.unwrap();
        let status = responses.next().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::DataLoss);
        assert!(responses.next().await.is_none());
        assert_eq!(mux.registry().subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_stream_cleanly() {
        let mux = mux_with(Arc::new(NoopScheduler), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        tx.send(Ok(heartbeat(0, Some(1)))).await.unwrap();
        responses.next().await.unwrap().unwrap();

        mux.shutdown.cancel();
        assert!(responses.next().await.is_none());
        assert_eq!(mux.registry().subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn next_heartbeat_waits_until_instruction_is_taken() {
        let scheduler = Arc::new(EchoScheduler {
            seen: Mutex::new(Vec::new()),
        });
        let mux = mux_with(scheduler.clone(), HeartbeatMode::Stream);
        let (tx, mut responses) = connect(&mux);

        tx.send(Ok(heartbeat(7, Some(1)))).await.unwrap();
        tx.send(Ok(heartbeat(8, Some(1)))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*scheduler.seen.lock().unwrap(), vec![7]);

        assert_eq!(responses.next().await.unwrap().unwrap().region_id, 7);
        assert_eq!(responses.next().await.unwrap().unwrap().region_id, 8);
        assert_eq!(*scheduler.seen.lock().unwrap(), vec![7, 8]);
    }

    fn instruction(region_id: u64) -> proto::RegionHeartbeatResponse {
        proto::RegionHeartbeatResponse {
            region_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ack_waits_until_client_reads() {
        let registry = WatchRegistry::new(4);
        let sub = registry.subscribe(1, 10).unwrap();
        let key = sub.key();
        let (out, mut rx): (Outbound, _) = mpsc::channel(1);
        let scope = CancellationToken::new();
        let (errors_tx, _errors_rx) = mpsc::channel(1);
        let pusher = tokio::spawn(push_loop(
            sub,
            out,
            HeaderBuilder::new(CLUSTER_ID),
            scope.clone(),
            errors_tx,
        ));

        let first = registry.send_to(&key, instruction(1), &scope).await.unwrap();
        let second = registry.send_to(&key, instruction(2), &scope).await.unwrap();
        let mut first = pin!(first.wait());
        let mut second = pin!(second.wait());

        let wait = Duration::from_millis(100);
        assert!(tokio::time::timeout(wait, &mut first).await.is_err());

        let taken = rx.recv().await.unwrap().unwrap();
        assert_eq!(taken.region_id, 1);
        assert_eq!(taken.header.unwrap().cluster_id, CLUSTER_ID);
        assert_eq!(first.await, Ok(()));
        assert!(tokio::time::timeout(wait, &mut second).await.is_err());

        assert_eq!(rx.recv().await.unwrap().unwrap().region_id, 2);
        assert_eq!(second.await, Ok(()));

        scope.cancel();
        pusher.await.unwrap();
        assert_eq!(registry.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn failed_write_aborts_stream_and_releases_subscription() {
        let registry = WatchRegistry::new(4);
        let sub = registry.subscribe(1, 10).unwrap();
        let key = sub.key();
        let (out, rx): (Outbound, _) = mpsc::channel(1);
        out.try_send(Ok(instruction(0))).unwrap();
        let scope = CancellationToken::new();
        let (errors_tx, mut errors_rx) = mpsc::channel(1);
        let pusher = tokio::spawn(push_loop(
            sub,
            out,
            HeaderBuilder::new(CLUSTER_ID),
            scope.clone(),
            errors_tx,
        ));

        let ack = registry.send_to(&key, instruction(1), &scope).await.unwrap();
        // Outbound is full: the pusher is parked on the write.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(rx);

        assert!(matches!(ack.wait().await, Err(DeliveryError::WriteFailed(_))));
        let status = errors_rx.recv().await.unwrap();
        assert_eq!(status.code(), tonic::Code::Aborted);
        pusher.await.unwrap();
        assert!(scope.is_cancelled());
        assert_eq!(registry.subscriber_count(1), 0);
    }
}
