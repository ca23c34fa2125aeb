//! Rejection sampling over batched simulations.
//!
//! The sampler drives a [`BatchHandler`], records every replicate's parameter
//! draw and discrepancy, and stops once the stopping rule can accept the
//! requested number of samples or the simulation budget runs out.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::error::{ExecutionError, FailureCause, SimError, SimResult, ValidationError};
use crate::executor::BatchResult;
use crate::graph::{compile, ModelGraph, Plan};
use crate::handler::{BatchHandler, BatchHandlerConfig};
use crate::output_pool::OutputPool;

/// Slack for `q * n` landing a hair above an integer.
const RANK_EPSILON: f64 = 1e-9;

/// When to stop and what to accept.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum StoppingRule {
    /// Accept the given quantile of all simulated discrepancies.
    Quantile(f64),
    /// Accept discrepancies at or below a fixed threshold.
    Threshold(f64),
}

/// Rejection sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionConfig {
    /// Number of samples to accept.
    pub n_samples: usize,
    /// Parameter nodes to record.
    pub parameter_names: Vec<String>,
    /// Node producing one discrepancy per replicate.
    pub discrepancy: String,
    /// Stopping rule.
    pub rule: StoppingRule,
    /// Upper bound on simulations; `None` for unlimited.
    #[serde(default)]
    pub budget: Option<u64>,
    /// Batch handler settings.
    #[serde(default)]
    pub handler: BatchHandlerConfig,
}

impl RejectionConfig {
    /// Creates a configuration without a budget.
    #[must_use]
    pub fn new<I, S>(parameter_names: I, discrepancy: impl Into<String>, n_samples: usize, rule: StoppingRule) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            n_samples,
            parameter_names: parameter_names.into_iter().map(Into::into).collect(),
            discrepancy: discrepancy.into(),
            rule,
            budget: None,
            handler: BatchHandlerConfig::default(),
        }
    }

    /// Sets the simulation budget.
    #[must_use]
    pub fn with_budget(mut self, budget: u64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Sets the handler concurrency limit.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.handler.max_in_flight = Some(max_in_flight);
        self
    }

    /// Validates the configuration and returns the batch issue budget.
    ///
    /// # Errors
    /// The first invalid setting found.
    pub fn max_batches(&self, batch_size: usize) -> Result<u64, ValidationError> {
        if self.parameter_names.is_empty() {
            return Err(ValidationError::NoParameters);
        }
        if self.n_samples == 0 {
            return Err(ValidationError::ZeroSamples);
        }
        match self.rule {
            StoppingRule::Quantile(q) if !(q > 0.0 && q <= 1.0) => {
                return Err(ValidationError::InvalidQuantile { value: q });
            }
            StoppingRule::Threshold(t) if !t.is_finite() => {
                return Err(ValidationError::InvalidThreshold { value: t });
            }
            _ => {}
        }
        if batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }
        match self.budget {
            None => Ok(u64::MAX),
            Some(budget) => {
                let batches = budget / batch_size as u64;
                if batches == 0 {
                    return Err(ValidationError::BudgetTooSmall { budget, batch_size });
                }
                Ok(batches)
            }
        }
    }
}

/// Sampler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerState {
    /// Waiting for the next batch.
    AwaitingBatch,
    /// Recording a batch.
    Accumulating,
    /// Finished.
    Done,
}

/// One simulated replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Parameter rows keyed by node name.
    pub parameters: BTreeMap<String, Vec<f64>>,
    /// Discrepancy of the replicate.
    pub discrepancy: f64,
}

/// Every replicate recorded during a run, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct SampleAccumulator {
    records: Vec<Sample>,
    /// Discrepancies in `total_cmp` order.
    sorted: Vec<f64>,
    simulations: u64,
    batches: u64,
}

impl SampleAccumulator {
    /// Records every replicate of `batch`.
    ///
    /// # Errors
    /// `DiscrepancyNotScalar` if the discrepancy rows are not one value wide;
    /// a shape error if an output does not have one row per replicate; an
    /// internal error if a requested output is missing. Nothing is recorded
    /// when an error is returned.
    pub fn record(&mut self, batch: &BatchResult, parameter_names: &[String], discrepancy: &str) -> SimResult<()> {
        let output = |name: &str| {
            batch
                .get(name)
                .ok_or_else(|| SimError::internal(format!("batch {} has no output '{name}'", batch.batch_index)))
        };
        let d = output(discrepancy)?;
        if d.width() != 1 {
            return Err(ValidationError::DiscrepancyNotScalar {
                node: discrepancy.to_string(),
                width: d.width(),
            }
            .into());
        }
        let params = parameter_names
            .iter()
            .map(|name| output(name).map(|array| (name, array)))
            .collect::<SimResult<Vec<_>>>()?;
        let shapes = std::iter::once((discrepancy, d)).chain(params.iter().map(|(name, array)| (name.as_str(), *array)));
        for (name, array) in shapes {
            if array.len() != batch.batch_size {
                return Err(ExecutionError {
                    node: name.to_string(),
                    batch_index: batch.batch_index,
                    cause: FailureCause::Shape {
                        expected: batch.batch_size,
                        actual: array.len(),
                    },
                }
                .into());
            }
        }

        let param_rows: Vec<(&String, Vec<&[f64]>)> =
            params.iter().map(|(name, array)| (*name, array.rows().collect())).collect();
        self.records.reserve(d.len());
        for (i, row) in d.rows().enumerate() {
            let parameters = param_rows
                .iter()
                .map(|(name, rows)| ((*name).clone(), rows[i].to_vec()))
                .collect();
            self.records.push(Sample {
                parameters,
                discrepancy: row[0],
            });
        }
        // Two sorted runs; the stable sort merges them in linear time.
        let mut fresh: Vec<f64> = d.values().to_vec();
        fresh.sort_by(f64::total_cmp);
        self.sorted.extend(fresh);
        self.sorted.sort_by(f64::total_cmp);
        self.simulations += batch.batch_size as u64;
        self.batches += 1;
        Ok(())
    }

    /// Recorded replicates in arrival order.
    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.records
    }

    /// Recorded discrepancies in arrival order.
    #[must_use]
    pub fn discrepancies(&self) -> Vec<f64> {
        self.records.iter().map(|s| s.discrepancy).collect()
    }

    /// Number of recorded replicates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Simulations consumed.
    #[must_use]
    pub const fn simulations(&self) -> u64 {
        self.simulations
    }

    /// Batches consumed.
    #[must_use]
    pub const fn batches(&self) -> u64 {
        self.batches
    }

    /// Replicates with discrepancy at or below `threshold`.
    #[must_use]
    pub fn count_within(&self, threshold: f64) -> usize {
        self.sorted.partition_point(|d| within(*d, threshold))
    }

    /// The `q` quantile of every recorded discrepancy.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted[quantile_rank(q, self.sorted.len()) - 1])
    }

    /// Up to `n` replicates at or below `threshold`, lowest discrepancy
    /// first; exact ties keep arrival order.
    #[must_use]
    pub fn select(&self, n: usize, threshold: f64) -> Vec<Sample> {
        let mut order: Vec<&Sample> = self.records.iter().filter(|s| within(s.discrepancy, threshold)).collect();
        order.sort_by(|a, b| a.discrepancy.total_cmp(&b.discrepancy));
        order.into_iter().take(n).cloned().collect()
    }
}

/// Discrepancy ordering shared by counting, selection and quantiles.
fn within(discrepancy: f64, threshold: f64) -> bool {
    discrepancy.total_cmp(&threshold) != Ordering::Greater
}

/// 1-based rank of the `q` quantile among `n` values.
fn quantile_rank(q: f64, n: usize) -> usize {
    let rank = (q * n as f64 - RANK_EPSILON).ceil();
    (rank.max(1.0) as usize).min(n)
}

/// The `q` quantile of `values`: the smallest value with at least a `q`
/// fraction of all values at or below it. `None` for an empty slice.
#[must_use]
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted[quantile_rank(q, sorted.len()) - 1])
}

/// Outcome of one rejection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionResult {
    /// Accepted samples, lowest discrepancy first.
    pub samples: Vec<Sample>,
    /// Acceptance threshold.
    pub threshold: f64,
    /// Simulations consumed.
    pub simulations: u64,
    /// Number of accepted samples.
    pub accepted: usize,
    /// Batches consumed.
    pub batches: u64,
    /// True if the budget ran out before enough samples were accepted.
    pub budget_exhausted: bool,
}

impl RejectionResult {
    /// Accepted fraction of all simulations.
    #[must_use]
    pub fn acceptance_rate(&self) -> f64 {
        if self.simulations == 0 {
            0.0
        } else {
            self.accepted as f64 / self.simulations as f64
        }
    }

    /// Accepted rows of parameter `name`.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Vec<&[f64]> {
        self.samples
            .iter()
            .filter_map(|s| s.parameters.get(name).map(Vec::as_slice))
            .collect()
    }
}

/// Rejection sampler.
#[derive(Debug)]
pub struct Rejection {
    graph: ModelGraph,
    config: RejectionConfig,
    client: Arc<Client>,
    plan: Arc<Plan>,
    max_batches: u64,
    pool: Option<OutputPool>,
    accumulator: SampleAccumulator,
    state: SamplerState,
}

impl Rejection {
    /// Validates `config` against `graph` and compiles the plan.
    ///
    /// # Errors
    /// Validation errors for the configuration and graph errors for unknown
    /// parameter or discrepancy nodes.
    pub fn new(graph: &ModelGraph, config: RejectionConfig, client: Arc<Client>) -> SimResult<Self> {
        let max_batches = config.max_batches(graph.context().batch_size)?;
        let plan = Arc::new(compile(graph, &Self::outputs(&config, None))?);
        Ok(Self {
            graph: graph.clone(),
            config,
            client,
            plan,
            max_batches,
            pool: None,
            accumulator: SampleAccumulator::default(),
            state: SamplerState::AwaitingBatch,
        })
    }

    /// Records every consumed batch into `pool`; its stored nodes become
    /// extra plan outputs.
    ///
    /// # Errors
    /// `InvalidConfig` if the pool already belongs to another computation
    /// context; graph errors if a stored node does not exist.
    pub fn with_pool(mut self, mut pool: OutputPool) -> SimResult<Self> {
        match pool.context() {
            None => pool.set_context(self.graph.context())?,
            Some(context) if context != self.graph.context() => {
                return Err(ValidationError::InvalidConfig {
                    reason: format!(
                        "output pool context (batch size {}, seed {}) differs from the graph's (batch size {}, seed {})",
                        context.batch_size,
                        context.seed,
                        self.graph.context().batch_size,
                        self.graph.context().seed
                    ),
                }
                .into());
            }
            Some(_) => {}
        }
        self.plan = Arc::new(compile(&self.graph, &Self::outputs(&self.config, Some(&pool)))?);
        self.pool = Some(pool);
        Ok(self)
    }

    fn outputs(config: &RejectionConfig, pool: Option<&OutputPool>) -> Vec<String> {
        let mut outputs = config.parameter_names.clone();
        outputs.push(config.discrepancy.clone());
        if let Some(pool) = pool {
            outputs.extend(pool.outputs().into_iter().map(str::to_string));
        }
        outputs
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SamplerState {
        self.state
    }

    /// Replicates recorded by the latest run.
    #[must_use]
    pub const fn accumulator(&self) -> &SampleAccumulator {
        &self.accumulator
    }

    /// Output pool, if one was attached.
    #[must_use]
    pub const fn pool(&self) -> Option<&OutputPool> {
        self.pool.as_ref()
    }

    /// Compiled plan.
    #[must_use]
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Runs the sampler to completion.
    ///
    /// With an unlimited budget and a threshold no replicate can reach, the
    /// run does not terminate.
    ///
    /// # Errors
    /// The first failing batch aborts the run; in-flight batches are cancelled.
    pub fn sample(&mut self) -> SimResult<RejectionResult> {
        self.accumulator = SampleAccumulator::default();
        self.state = SamplerState::AwaitingBatch;
        tracing::info!(
            n_samples = self.config.n_samples,
            rule = ?self.config.rule,
            budget = ?self.config.budget,
            batch_size = self.plan.batch_size(),
            "rejection sampling started"
        );

        let mut handler = BatchHandler::with_config(Arc::clone(&self.client), self.config.handler);
        let outcome = self.drive(&mut handler);
        handler.cancel_all();
        self.state = SamplerState::Done;

        match outcome {
            Ok(()) => {
                let result = self.finish();
                tracing::info!(
                    accepted = result.accepted,
                    simulations = result.simulations,
                    threshold = result.threshold,
                    budget_exhausted = result.budget_exhausted,
                    "rejection sampling finished"
                );
                Ok(result)
            }
            Err(e) => {
                tracing::error!(error = %e, batch_index = ?e.batch_index(), "rejection sampling aborted");
                Err(e)
            }
        }
    }

    fn drive(&mut self, handler: &mut BatchHandler) -> SimResult<()> {
        handler.start(Arc::clone(&self.plan), self.max_batches)?;
        while handler.has_outputs() {
            let batch = handler.next_output()?;
            self.state = SamplerState::Accumulating;
            self.accumulator
                .record(&batch, &self.config.parameter_names, &self.config.discrepancy)?;
            if let Some(pool) = self.pool.as_mut() {
                pool.add_batch(&batch);
            }
            if self.enough() {
                return Ok(());
            }
            self.state = SamplerState::AwaitingBatch;
        }
        Ok(())
    }

    fn enough(&self) -> bool {
        let n = self.config.n_samples;
        match self.config.rule {
            StoppingRule::Quantile(q) => self
                .accumulator
                .quantile(q)
                .is_some_and(|threshold| self.accumulator.count_within(threshold) >= n),
            StoppingRule::Threshold(t) => self.accumulator.count_within(t) >= n,
        }
    }

    fn finish(&self) -> RejectionResult {
        let budget_exhausted = !self.enough();
        let threshold = match self.config.rule {
            StoppingRule::Quantile(q) => self.accumulator.quantile(q).unwrap_or(f64::NAN),
            StoppingRule::Threshold(t) => t,
        };
        let samples = self.accumulator.select(self.config.n_samples, threshold);
        RejectionResult {
            accepted: samples.len(),
            samples,
            threshold,
            simulations: self.accumulator.simulations(),
            batches: self.accumulator.batches(),
            budget_exhausted,
        }
    }
}
