//! Batch handler: per-run bookkeeping of in-flight batches.
//!
//! The handler keeps up to `max_in_flight` batches submitted, hands back one
//! resolved batch per call to [`BatchHandler::next_output`], and refills the
//! pipeline with the next sequential batch index after every output until
//! `max_batches` have been issued.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::client::{BatchHandle, Client};
use crate::error::{ClientError, SimError, SimResult, ValidationError};
use crate::executor::BatchResult;
use crate::graph::Plan;

/// How long a handler with nothing in flight waits for a saturated backend.
const SATURATED_WAIT: Duration = Duration::from_secs(10);

/// Upper bound on one back-off sleep while the backend is saturated.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Handler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchHandlerConfig {
    /// Concurrency limit. `None` uses the client's parallelism.
    pub max_in_flight: Option<usize>,
}

/// Tracks the batches of one inference run.
#[derive(Debug)]
pub struct BatchHandler {
    client: Arc<Client>,
    plan: Option<Arc<Plan>>,
    in_flight: Vec<BatchHandle>,
    next_index: u64,
    max_batches: u64,
    max_in_flight: usize,
    completed: u64,
    /// Refill failure held back so the batch that triggered it is delivered.
    deferred: Option<SimError>,
}

impl BatchHandler {
    /// Creates a handler with the default concurrency limit.
    #[must_use]
    pub fn new(client: Arc<Client>) -> Self {
        Self::with_config(client, BatchHandlerConfig::default())
    }

    /// Creates a handler with an explicit configuration.
    #[must_use]
    pub fn with_config(client: Arc<Client>, config: BatchHandlerConfig) -> Self {
        let max_in_flight = config.max_in_flight.unwrap_or_else(|| client.num_cores()).max(1);
        Self {
            client,
            plan: None,
            in_flight: Vec::new(),
            next_index: 0,
            max_batches: 0,
            max_in_flight,
            completed: 0,
            deferred: None,
        }
    }

    /// Starts issuing batches `0..max_batches` of `plan`.
    ///
    /// Any work from a previous start is cancelled first.
    ///
    /// # Errors
    /// `ZeroBatchSize` if the plan has no replicates per batch, or the
    /// submission error of the first batch.
    pub fn start(&mut self, plan: Arc<Plan>, max_batches: u64) -> SimResult<()> {
        if plan.batch_size() == 0 {
            return Err(ValidationError::ZeroBatchSize.into());
        }
        self.cancel_all();
        self.deferred = None;
        tracing::debug!(max_batches, max_in_flight = self.max_in_flight, plan = %plan.fingerprint(), "batch handler started");
        self.plan = Some(plan);
        self.next_index = 0;
        self.completed = 0;
        self.max_batches = max_batches;
        self.fill()
    }

    /// Returns true while batches are in flight or a refill error is
    /// waiting to be reported by the next call to `next_output`.
    #[must_use]
    pub fn has_outputs(&self) -> bool {
        !self.in_flight.is_empty() || self.deferred.is_some()
    }

    /// Blocks until a batch resolves and returns it.
    ///
    /// Among batches resolved at the same time, the lowest index is returned
    /// first. A failed batch is returned as its error; it is not retried.
    ///
    /// If refilling the pipeline fails after a batch resolves, that batch is
    /// still returned and the refill error is returned by the next call.
    ///
    /// # Errors
    /// The batch's error, a deferred refill error, or an internal error when
    /// nothing is in flight.
    pub fn next_output(&mut self) -> SimResult<BatchResult> {
        self.next(None)
    }

    /// Like [`next_output`](Self::next_output) but gives up after `timeout`
    /// with `ClientError::Timeout`. In-flight batches are left untouched.
    pub fn next_output_timeout(&mut self, timeout: Duration) -> SimResult<BatchResult> {
        self.next(Some(timeout))
    }

    /// Cancels every in-flight batch and drops any deferred refill error.
    pub fn cancel_all(&mut self) {
        self.deferred = None;
        if !self.in_flight.is_empty() {
            tracing::debug!(cancelled = self.in_flight.len(), "cancelling in-flight batches");
        }
        for handle in &mut self.in_flight {
            self.client.cancel(handle);
        }
        self.in_flight.clear();
    }

    /// Batches submitted since `start`.
    #[must_use]
    pub const fn num_issued(&self) -> u64 {
        self.next_index
    }

    /// Batches returned by `next_output` since `start`, failures included.
    #[must_use]
    pub const fn num_completed(&self) -> u64 {
        self.completed
    }

    /// Batches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Concurrency limit.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Issue budget of the current run.
    #[must_use]
    pub const fn max_batches(&self) -> u64 {
        self.max_batches
    }

    /// Returns true once `start` has been called.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.plan.is_some()
    }

    fn next(&mut self, timeout: Option<Duration>) -> SimResult<BatchResult> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        if self.in_flight.is_empty() {
            return Err(SimError::internal("no batches in flight"));
        }
        let ready = self.client.wait_any(&mut self.in_flight, timeout)?;
        let position = ready
            .into_iter()
            .min_by_key(|&i| self.in_flight[i].batch_index())
            .ok_or_else(|| SimError::internal("no batch resolved"))?;

        let mut handle = self.in_flight.remove(position);
        let outcome = handle
            .take()
            .ok_or_else(|| SimError::internal("resolved batch has no outcome"))?;
        self.completed += 1;
        tracing::debug!(
            batch_index = handle.batch_index(),
            ok = outcome.is_ok(),
            in_flight = self.in_flight.len(),
            "batch resolved"
        );

        if let Err(err) = self.fill() {
            tracing::warn!(error = %err, "refill failed; reporting it on the next call");
            self.deferred = Some(err);
        }
        outcome
    }

    fn fill(&mut self) -> SimResult<()> {
        let Some(plan) = self.plan.clone() else {
            return Ok(());
        };
        let mut saturated_since: Option<Instant> = None;
        let mut backoff = Duration::from_millis(1);
        while self.in_flight.len() < self.max_in_flight && self.next_index < self.max_batches {
            match self.client.submit(&plan, self.next_index, plan.batch_size()) {
                Ok(handle) => {
                    self.in_flight.push(handle);
                    self.next_index += 1;
                }
                // The backend is saturated; retry on the next output.
                Err(SimError::Client(ClientError::QueueFull { .. })) if !self.in_flight.is_empty() => break,
                // Nothing of ours is queued, so the queue is held by other
                // submitters and drains without us.
                Err(e @ SimError::Client(ClientError::QueueFull { .. })) => {
                    let since = *saturated_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= SATURATED_WAIT {
                        return Err(e);
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for BatchHandler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
