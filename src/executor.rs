//! Batch executor: evaluates one compiled plan for one batch.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::array::BatchArray;
use crate::error::{ExecutionError, FailureCause};
use crate::graph::{EvalContext, Plan};

/// Outputs of one successfully executed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Originating batch index.
    pub batch_index: u64,
    /// Replicates per output.
    pub batch_size: usize,
    /// Output arrays keyed by node name.
    pub outputs: BTreeMap<String, BatchArray>,
}

impl BatchResult {
    /// Output of `node`, if it was requested.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&BatchArray> {
        self.outputs.get(node)
    }
}

/// Executes `plan` for one batch.
///
/// Every step runs exactly once, in plan order. Each node gets a generator
/// seeded from (plan seed, `batch_index`, node name). The first failing node
/// stops the batch; no partial result is returned.
pub fn execute(plan: &Plan, batch_index: u64, batch_size: usize) -> Result<BatchResult, ExecutionError> {
    let seeds = plan.seed_rule();
    let mut computed: Vec<BatchArray> = Vec::with_capacity(plan.len());

    for step in plan.steps() {
        let fail = |cause| ExecutionError {
            node: step.name.clone(),
            batch_index,
            cause,
        };

        let inputs: Vec<&BatchArray> = step.inputs.iter().map(|&i| &computed[i]).collect();
        let mut rng = StdRng::from_seed(seeds.node_seed(batch_index, &step.name));
        let mut ctx = EvalContext {
            batch_index,
            batch_size,
            rng: &mut rng,
        };

        tracing::trace!(node = %step.name, batch_index, "evaluating node");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| step.operation.evaluate(&inputs, &mut ctx)));
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(fail(FailureCause::Operation {
                    message: e.to_string(),
                }))
            }
            Err(payload) => {
                return Err(fail(FailureCause::Panic {
                    message: panic_message(payload.as_ref()),
                }))
            }
        };

        if output.len() != batch_size {
            return Err(fail(FailureCause::Shape {
                expected: batch_size,
                actual: output.len(),
            }));
        }
        computed.push(output);
    }

    let mut outputs = BTreeMap::new();
    for name in plan.outputs() {
        if let Some(pos) = plan.position(name) {
            outputs.insert(name.clone(), computed[pos].clone());
        }
    }

    Ok(BatchResult {
        batch_index,
        batch_size,
        outputs,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
