//! Gateway error types and the rejection/domain classification table.

use thiserror::Error;
use tonic::Status;

use pdgate_state::StateError;

use crate::proto;

/// Errors raised while admitting or serving a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not leader")]
    NotLeader,

    #[error("mismatch cluster id, need {expected} but got {got}")]
    ClusterMismatch { expected: u64, got: u64 },

    #[error("cluster is not bootstrapped")]
    NotBootstrapped,

    #[error("cluster is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("store {store_id} is tombstone")]
    StoreTombstone { store_id: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cluster state error: {0}")]
    State(#[source] StateError),

    #[error("allocator error: {0}")]
    Alloc(String),

    #[error("server not started")]
    NotStarted,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Where an error surfaces: as a transport failure or inside the
/// response envelope.
#[derive(Debug)]
pub enum Classified {
    /// The request was rejected before (or while) being attempted.
    Reject(Status),
    /// The domain reports a known condition; the RPC itself succeeds.
    Domain(proto::Error),
}

impl GatewayError {
    /// Map this error onto the transport/domain split.
    pub fn classify(self) -> Classified {
        use proto::ErrorType;

        let domain = |ty: ErrorType, message: String| {
            Classified::Domain(proto::Error {
                r#type: ty as i32,
                message,
            })
        };

        match self {
            GatewayError::NotLeader => Classified::Reject(Status::unavailable(self.to_string())),
            GatewayError::ClusterMismatch { .. } => {
                Classified::Reject(Status::failed_precondition(self.to_string()))
            }
            GatewayError::InvalidRequest(_) => {
                Classified::Reject(Status::invalid_argument(self.to_string()))
            }
            GatewayError::NotStarted => Classified::Reject(Status::unavailable(self.to_string())),
            GatewayError::State(_) | GatewayError::Alloc(_) => {
                Classified::Reject(Status::internal(self.to_string()))
            }
            GatewayError::NotBootstrapped => domain(ErrorType::NotBootstrapped, self.to_string()),
            GatewayError::AlreadyBootstrapped => {
                domain(ErrorType::AlreadyBootstrapped, self.to_string())
            }
            GatewayError::StoreTombstone { .. } => domain(ErrorType::StoreTombstone, self.to_string()),
        }
    }

    /// Collapse to a transport status, for paths with no envelope to
    /// carry a domain error (stream setup).
    pub fn into_status(self) -> Status {
        match self.classify() {
            Classified::Reject(status) => status,
            Classified::Domain(err) => Status::failed_precondition(err.message),
        }
    }
}

impl From<StateError> for GatewayError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::AlreadyBootstrapped => GatewayError::AlreadyBootstrapped,
            other => GatewayError::State(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    fn reject_code(err: GatewayError) -> Code {
        match err.classify() {
            Classified::Reject(status) => status.code(),
            Classified::Domain(e) => panic!("expected rejection, got domain error {e:?}"),
        }
    }

    fn domain_type(err: GatewayError) -> proto::ErrorType {
        match err.classify() {
            Classified::Domain(e) => e.r#type(),
            Classified::Reject(s) => panic!("expected domain error, got {s:?}"),
        }
    }

    #[test]
    fn guard_failures_are_rejections() {
        assert_eq!(reject_code(GatewayError::NotLeader), Code::Unavailable);
        assert_eq!(
            reject_code(GatewayError::ClusterMismatch { expected: 1, got: 2 }),
            Code::FailedPrecondition
        );
    }

    #[test]
    fn mismatch_message_carries_both_ids() {
        match (GatewayError::ClusterMismatch { expected: 11, got: 22 }).classify() {
            Classified::Reject(status) => {
                assert!(status.message().contains("11"));
                assert!(status.message().contains("22"));
            }
            Classified::Domain(_) => panic!("mismatch must be a rejection"),
        }
    }

    #[test]
    fn malformed_and_internal_are_distinct_codes() {
        assert_eq!(
            reject_code(GatewayError::InvalidRequest("x".into())),
            Code::InvalidArgument
        );
        assert_eq!(reject_code(GatewayError::Alloc("x".into())), Code::Internal);
        assert_eq!(
            reject_code(GatewayError::State(StateError::Read("x".into()))),
            Code::Internal
        );
    }

    #[test]
    fn store_level_double_bootstrap_maps_to_domain_error() {
        let err: GatewayError = StateError::AlreadyBootstrapped.into();
        assert_eq!(domain_type(err), proto::ErrorType::AlreadyBootstrapped);
    }

    #[test]
    fn domain_conditions_stay_in_band() {
        assert_eq!(
            domain_type(GatewayError::NotBootstrapped),
            proto::ErrorType::NotBootstrapped
        );
        assert_eq!(
            domain_type(GatewayError::AlreadyBootstrapped),
            proto::ErrorType::AlreadyBootstrapped
        );
        assert_eq!(
            domain_type(GatewayError::StoreTombstone { store_id: 3 }),
            proto::ErrorType::StoreTombstone
        );
    }
}
