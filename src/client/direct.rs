//! Direct backend: runs each batch synchronously on the caller's thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{SimError, SimResult};
use crate::executor;
use crate::graph::Plan;

use super::handle::BatchHandle;

/// Synchronous backend. `submit` returns an already-resolved handle.
#[derive(Debug, Default)]
pub struct DirectClient {
    executed: AtomicU64,
}

impl DirectClient {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Executes the batch immediately.
    pub fn submit(&self, plan: &Arc<Plan>, batch_index: u64, batch_size: usize) -> SimResult<BatchHandle> {
        let outcome = executor::execute(plan, batch_index, batch_size).map_err(SimError::from);
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(BatchHandle::resolved(batch_index, outcome))
    }

    /// Batches executed so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{compile, ComputationContext, Input, ModelGraph, NodeRole, OpRef, OperationRegistry};

    #[test]
    fn submit_executes_before_returning() {
        let mut g = ModelGraph::new(Arc::new(OperationRegistry::standard())).with_context(ComputationContext::new(3, 9));
        g.add_node("u", OpRef::uniform(0.0, 1.0), Vec::<Input>::new(), NodeRole::Stochastic)
            .unwrap();
        g.freeze().unwrap();
        let plan = Arc::new(compile(&g, &["u"]).unwrap());

        let client = DirectClient::new();
        assert_eq!(client.executed(), 0);
        let mut handles: Vec<BatchHandle> = (0..3).map(|i| client.submit(&plan, i, 3).unwrap()).collect();
        assert_eq!(client.executed(), 3);
        for handle in &mut handles {
            assert!(handle.is_done());
            let result = handle.take().unwrap().unwrap();
            assert_eq!(result, executor::execute(&plan, result.batch_index, 3).unwrap());
        }
    }
}
