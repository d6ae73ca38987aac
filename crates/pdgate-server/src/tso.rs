//! Timestamp oracle stream.
//!
//! Each inbound request is guard-checked and answered, in order, with
//! `count` timestamps ending at the returned one. Any failure ends the
//! stream with that status.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use crate::alloc::TsoAllocator;
use crate::error::GatewayError;
use crate::guard::ClusterGuard;
use crate::header::HeaderBuilder;
use crate::proto;

pub type TsoStream = ReceiverStream<Result<proto::TsoResponse, Status>>;

/// Start serving one TSO stream.
pub fn open<S>(
    guard: ClusterGuard,
    tso: Arc<dyn TsoAllocator>,
    inbound: S,
    shutdown: CancellationToken,
) -> TsoStream
where
    S: Stream<Item = Result<proto::TsoRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(status) = serve(&guard, tso.as_ref(), inbound, &tx, &shutdown).await {
            warn!(code = ?status.code(), error = %status.message(), "tso stream failed");
            let _ = tx.send(Err(status)).await;
        }
    });
    ReceiverStream::new(rx)
}

async fn serve<S>(
    guard: &ClusterGuard,
    tso: &dyn TsoAllocator,
    mut inbound: S,
    out: &mpsc::Sender<Result<proto::TsoResponse, Status>>,
    shutdown: &CancellationToken,
) -> Result<(), Status>
where
    S: Stream<Item = Result<proto::TsoRequest, Status>> + Unpin,
{
    let headers = HeaderBuilder::new(guard.cluster_id());
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = inbound.next() => match next {
                None => return Ok(()),
                Some(Err(status)) => return Err(status),
                Some(Ok(request)) => request,
            },
        };

        guard
            .validate(request.header.as_ref())
            .map_err(GatewayError::into_status)?;
        let timestamp = tso.alloc(request.count).map_err(GatewayError::into_status)?;

        let response = proto::TsoResponse {
            header: Some(headers.ok()),
            count: request.count,
            timestamp: Some(timestamp),
        };
        if out.send(Ok(response)).await.is_err() {
            debug!("tso client went away");
            return Ok(());
        }
    }
}
