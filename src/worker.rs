//! Remote batch worker.
//!
//! A [`BatchWorker`] turns an encoded [`BatchRequest`] into an encoded
//! [`BatchReply`]. It is transport-agnostic: the gRPC service and the loopback
//! connection both delegate to [`BatchWorker::serve`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{SimError, SimResult, TransportError};
use crate::executor;
use crate::graph::{OperationRegistry, Plan};
use crate::wire::{BatchReply, BatchRequest, ReplyOutcome, WIRE_VERSION};

const PLAN_CACHE_MAX: usize = 64;

/// Executes batches described by wire requests.
#[derive(Debug)]
pub struct BatchWorker {
    registry: Arc<OperationRegistry>,
    plans: RwLock<HashMap<String, Arc<Plan>>>,
}

impl BatchWorker {
    /// Creates a worker resolving operations through `registry`.
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            registry,
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Handles one encoded request.
    ///
    /// Execution failures and unusable plans are answered with a reply; only
    /// undecodable or oversized payloads fail the call itself.
    pub fn serve(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let request = BatchRequest::decode(request)?;
        let outcome = self.run(&request);
        if let ReplyOutcome::Rejected { message } = &outcome {
            tracing::warn!(batch_index = request.batch_index, %message, "rejecting batch request");
        }
        BatchReply::to(&request, outcome).encode()
    }

    fn run(&self, request: &BatchRequest) -> ReplyOutcome {
        if request.version != WIRE_VERSION {
            return ReplyOutcome::Rejected {
                message: format!("unsupported wire version '{}'", request.version),
            };
        }
        if request.batch_size == 0 {
            return ReplyOutcome::Rejected {
                message: "batch size must be positive".to_string(),
            };
        }
        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(e) => {
                return ReplyOutcome::Rejected { message: e.to_string() };
            }
        };
        tracing::debug!(batch_index = request.batch_index, plan = %plan.fingerprint(), "executing remote batch");
        match executor::execute(&plan, request.batch_index, request.batch_size) {
            Ok(result) => ReplyOutcome::Completed {
                outputs: result.outputs,
            },
            Err(error) => ReplyOutcome::Failed { error },
        }
    }

    fn plan(&self, request: &BatchRequest) -> SimResult<Arc<Plan>> {
        let fingerprint = request.plan.fingerprint()?;
        {
            let guard = self
                .plans
                .read()
                .map_err(|_| SimError::internal("plan cache lock poisoned"))?;
            if let Some(plan) = guard.get(&fingerprint) {
                return Ok(Arc::clone(plan));
            }
        }

        let plan = Arc::new(Plan::from_spec(request.plan.clone(), &self.registry)?);
        let mut guard = self
            .plans
            .write()
            .map_err(|_| SimError::internal("plan cache lock poisoned"))?;
        if guard.len() >= PLAN_CACHE_MAX {
            guard.clear();
        }
        guard.insert(fingerprint, Arc::clone(&plan));
        Ok(plan)
    }

    /// Number of cached plans.
    #[must_use]
    pub fn cached_plans(&self) -> usize {
        self.plans.read().map_or(0, |g| g.len())
    }
}
