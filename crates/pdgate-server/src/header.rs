//! Response envelopes.
//!
//! Every response carries a `ResponseHeader` with the server's cluster
//! id, on success and on error alike. [`HeaderBuilder::wrap`] is the one
//! place that turns a handler result into either an enveloped response or
//! a transport `Status`.

use tonic::Status;

use crate::error::{Classified, GatewayResult};
use crate::proto;

/// A response message with a `header` slot.
pub trait Envelope: Default {
    fn set_header(&mut self, header: proto::ResponseHeader);
}

macro_rules! impl_envelope {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Envelope for proto::$ty {
                fn set_header(&mut self, header: proto::ResponseHeader) {
                    self.header = Some(header);
                }
            }
        )*
    };
}

impl_envelope!(
    GetMembersResponse,
    TsoResponse,
    BootstrapResponse,
    IsBootstrappedResponse,
    AllocIdResponse,
    GetStoreResponse,
    PutStoreResponse,
    StoreHeartbeatResponse,
    RegionHeartbeatResponse,
    GetRegionResponse,
    AskSplitResponse,
    ReportSplitResponse,
    GetClusterConfigResponse,
    PutClusterConfigResponse,
);

/// Builds response headers stamped with this server's cluster id.
#[derive(Debug, Clone, Copy)]
pub struct HeaderBuilder {
    cluster_id: u64,
}

impl HeaderBuilder {
    pub fn new(cluster_id: u64) -> Self {
        Self { cluster_id }
    }

    /// Success header: cluster id set, no error.
    pub fn ok(&self) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.cluster_id,
            error: None,
        }
    }

    /// Header carrying an in-band domain error.
    pub fn error(&self, err: proto::Error) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.cluster_id,
            error: Some(err),
        }
    }

    /// Envelope a handler result.
    ///
    /// Domain errors become a default response whose header carries the
    /// error; rejections become the returned `Status`.
    pub fn wrap<R: Envelope>(&self, result: GatewayResult<R>) -> Result<R, Status> {
        match result {
            Ok(mut resp) => {
                resp.set_header(self.ok());
                Ok(resp)
            }
            Err(err) => match err.classify() {
                Classified::Reject(status) => Err(status),
                Classified::Domain(err) => {
                    let mut resp = R::default();
                    resp.set_header(self.error(err));
                    Ok(resp)
                }
            },
        }
    }

    /// A heartbeat response carrying only an error, used to report a
    /// per-message failure back on the heartbeat stream.
    pub fn error_instruction(
        &self,
        ty: proto::ErrorType,
        message: impl Into<String>,
    ) -> proto::RegionHeartbeatResponse {
        proto::RegionHeartbeatResponse {
            header: Some(self.error(proto::Error {
                r#type: ty as i32,
                message: message.into(),
            })),
            ..Default::default()
        }
    }
}
