//! Wire format shared by the distributed client and remote workers.
//!
//! Requests and replies are JSON documents. A request carries the plan as data
//! (operation names and parameters), so the worker only needs an operation
//! registry with the same names. Every reply must echo the request id and the
//! batch index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::array::BatchArray;
use crate::error::{ClientError, ExecutionError, SimError, TransportError};
use crate::executor::BatchResult;
use crate::graph::PlanSpec;

/// Protocol version spoken by this build.
pub const WIRE_VERSION: &str = "1.0";

/// Maximum size of an encoded batch request.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Maximum size of an encoded batch reply.
pub const MAX_REPLY_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// One batch to execute remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Protocol version.
    pub version: String,
    /// Correlation id, echoed by the reply.
    pub request_id: Uuid,
    /// Plan to execute.
    pub plan: PlanSpec,
    /// Batch to execute.
    pub batch_index: u64,
    /// Replicates in the batch.
    pub batch_size: usize,
}

impl BatchRequest {
    /// Builds a request with a fresh id.
    #[must_use]
    pub fn new(plan: PlanSpec, batch_index: u64, batch_size: usize) -> Self {
        Self {
            version: WIRE_VERSION.to_string(),
            request_id: Uuid::new_v4(),
            plan,
            batch_index,
            batch_size,
        }
    }

    /// Encodes the request, enforcing the size limit.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        encode(self, MAX_REQUEST_BYTES)
    }

    /// Decodes a request, enforcing the size limit.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        decode(bytes, MAX_REQUEST_BYTES)
    }
}

/// How a remote batch ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// Batch executed; outputs keyed by node name.
    Completed {
        /// Output arrays.
        outputs: BTreeMap<String, BatchArray>,
    },
    /// A node failed.
    Failed {
        /// The failure.
        error: ExecutionError,
    },
    /// The worker refused the request without executing it.
    Rejected {
        /// Reason given by the worker.
        message: String,
    },
}

/// Reply to one [`BatchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReply {
    /// Protocol version.
    pub version: String,
    /// Id of the request being answered.
    pub request_id: Uuid,
    /// Batch that was executed.
    pub batch_index: u64,
    /// Result.
    pub outcome: ReplyOutcome,
}

impl BatchReply {
    /// Builds a reply to `request`.
    #[must_use]
    pub fn to(request: &BatchRequest, outcome: ReplyOutcome) -> Self {
        Self {
            version: WIRE_VERSION.to_string(),
            request_id: request.request_id,
            batch_index: request.batch_index,
            outcome,
        }
    }

    /// Encodes the reply, enforcing the size limit.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        encode(self, MAX_REPLY_BYTES)
    }

    /// Decodes a reply, enforcing the size limit.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        decode(bytes, MAX_REPLY_BYTES)
    }

    /// Converts the reply into a batch outcome for `request`.
    ///
    /// # Errors
    /// `MismatchedReply` if the reply answers a different request or batch;
    /// `MalformedReply` if a requested output is missing or does not have
    /// one row per replicate.
    pub fn into_result(self, request: &BatchRequest) -> Result<BatchResult, SimError> {
        if self.request_id != request.request_id || self.batch_index != request.batch_index {
            return Err(TransportError::MismatchedReply {
                expected: request.batch_index,
                actual: self.batch_index,
            }
            .into());
        }
        match self.outcome {
            ReplyOutcome::Completed { outputs } => {
                check_outputs(request, &outputs)?;
                Ok(BatchResult {
                    batch_index: self.batch_index,
                    batch_size: request.batch_size,
                    outputs,
                })
            }
            ReplyOutcome::Failed { error } => Err(error.into()),
            ReplyOutcome::Rejected { message } => Err(ClientError::RemoteRejected {
                batch_index: self.batch_index,
                message,
            }
            .into()),
        }
    }
}

fn check_outputs(request: &BatchRequest, outputs: &BTreeMap<String, BatchArray>) -> Result<(), TransportError> {
    let malformed = |reason: String| TransportError::MalformedReply {
        batch_index: request.batch_index,
        reason,
    };
    for name in &request.plan.outputs {
        if !outputs.contains_key(name) {
            return Err(malformed(format!("output '{name}' is missing")));
        }
    }
    for (name, array) in outputs {
        if array.len() != request.batch_size {
            return Err(malformed(format!(
                "output '{name}' has {} rows, expected {}",
                array.len(),
                request.batch_size
            )));
        }
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T, limit: usize) -> Result<Vec<u8>, TransportError> {
    let bytes = serde_json::to_vec(value).map_err(|e| TransportError::SerializationFailed { message: e.to_string() })?;
    if bytes.len() > limit {
        return Err(TransportError::PayloadTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], limit: usize) -> Result<T, TransportError> {
    if bytes.len() > limit {
        return Err(TransportError::PayloadTooLarge {
            size: bytes.len(),
            limit,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| TransportError::DeserializationFailed { message: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCause;
    use crate::graph::ComputationContext;

    fn request() -> BatchRequest {
        BatchRequest::new(
            PlanSpec {
                steps: Vec::new(),
                outputs: vec!["x".to_string()],
                context: ComputationContext::new(4, 1),
            },
            7,
            4,
        )
    }

    #[test]
    fn reply_for_other_request_is_mismatched() {
        let req = request();
        let mut reply = BatchReply::to(&req, ReplyOutcome::Completed { outputs: BTreeMap::new() });
        reply.request_id = Uuid::new_v4();
        let err = reply.into_result(&req).unwrap_err();
        assert!(matches!(
            err,
            SimError::Transport(TransportError::MismatchedReply { expected: 7, actual: 7 })
        ));

        let mut reply = BatchReply::to(&req, ReplyOutcome::Completed { outputs: BTreeMap::new() });
        reply.batch_index = 8;
        let err = reply.into_result(&req).unwrap_err();
        assert!(matches!(
            err,
            SimError::Transport(TransportError::MismatchedReply { expected: 7, actual: 8 })
        ));
    }

    #[test]
    fn failed_reply_carries_the_execution_error() {
        let req = request();
        let error = ExecutionError {
            node: "sim".to_string(),
            batch_index: 7,
            cause: FailureCause::Operation {
                message: "diverged".to_string(),
            },
        };
        let bytes = BatchReply::to(&req, ReplyOutcome::Failed { error: error.clone() })
            .encode()
            .unwrap();
        let err = BatchReply::decode(&bytes).unwrap().into_result(&req).unwrap_err();
        assert!(matches!(err, SimError::Execution(e) if e == error));
    }

    #[test]
    fn rejected_reply_is_a_client_error() {
        let req = request();
        let reply = BatchReply::to(
            &req,
            ReplyOutcome::Rejected {
                message: "unknown op".to_string(),
            },
        );
        let err = reply.into_result(&req).unwrap_err();
        assert!(matches!(err, SimError::Client(ClientError::RemoteRejected { batch_index: 7, .. })));
    }

    #[test]
    fn completed_reply_must_cover_every_replicate() {
        let req = request();
        let short = BTreeMap::from([("x".to_string(), BatchArray::from_scalars(vec![1.0]))]);
        let err = BatchReply::to(&req, ReplyOutcome::Completed { outputs: short })
            .into_result(&req)
            .unwrap_err();
        assert!(matches!(
            err,
            SimError::Transport(TransportError::MalformedReply { batch_index: 7, .. })
        ));

        let err = BatchReply::to(&req, ReplyOutcome::Completed { outputs: BTreeMap::new() })
            .into_result(&req)
            .unwrap_err();
        assert!(matches!(err, SimError::Transport(TransportError::MalformedReply { ref reason, .. }) if reason.contains("'x'")));

        let full = BTreeMap::from([("x".to_string(), BatchArray::from_scalars(vec![1.0; 4]))]);
        let result = BatchReply::to(&req, ReplyOutcome::Completed { outputs: full })
            .into_result(&req)
            .unwrap();
        assert_eq!(result.batch_size, 4);
    }

    #[test]
    fn floats_cross_the_wire_bit_for_bit() {
        let req = request();
        let values: Vec<f64> = (1..=10_000u32).map(|i| f64::from(i).sqrt() / 7.0 + 1e-17 * f64::from(i)).collect();
        let outputs = BTreeMap::from([("x".to_string(), BatchArray::from_scalars(values.clone()))]);
        let bytes = BatchReply::to(&req, ReplyOutcome::Completed { outputs }).encode().unwrap();
        let ReplyOutcome::Completed { outputs } = BatchReply::decode(&bytes).unwrap().outcome else {
            panic!("expected a completed reply");
        };
        let back = outputs["x"].values();
        for (sent, received) in values.iter().zip(back) {
            assert_eq!(sent.to_bits(), received.to_bits());
        }
    }

    #[test]
    fn garbage_does_not_decode() {
        let err = BatchRequest::decode(b"{not json").unwrap_err();
        assert!(matches!(err, TransportError::DeserializationFailed { .. }));
    }
}
