//! Local worker-pool backend.
//!
//! A fixed set of OS threads pulls batch jobs from one bounded queue, runs them
//! through the executor, and resolves the job's handle. Submission never blocks:
//! a full queue is reported as `QueueFull`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, SimError, SimResult};
use crate::executor;
use crate::graph::Plan;

use super::handle::{BatchHandle, Completer};

/// Local pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalPoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum queued batches.
    pub queue_capacity: usize,
}

impl Default for LocalPoolConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(2, usize::from),
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Execute {
        plan: Arc<Plan>,
        batch_index: u64,
        batch_size: usize,
        completer: Completer,
    },
}

/// Backend running batches on local worker threads.
#[derive(Debug)]
pub struct LocalPoolClient {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl LocalPoolClient {
    /// Spawns the worker threads.
    ///
    /// # Errors
    /// `BackendUnavailable` if no worker is requested or a thread cannot be spawned.
    pub fn start(config: &LocalPoolConfig) -> SimResult<Self> {
        if config.workers == 0 {
            return Err(ClientError::BackendUnavailable {
                reason: "local pool needs at least one worker".to_string(),
            }
            .into());
        }
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut pool = Self {
            tx: Some(tx),
            workers: Vec::with_capacity(config.workers),
            queue_capacity,
        };
        for idx in 0..config.workers {
            let rx: Receiver<Job> = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("simbatch-worker-{idx}"))
                .spawn(move || worker_loop(&rx));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Dropping the pool joins the workers that did start.
                    return Err(ClientError::BackendUnavailable {
                        reason: format!("failed to spawn worker {idx}: {e}"),
                    }
                    .into());
                }
            }
        }
        tracing::info!(workers = config.workers, queue_capacity, "local pool started");
        Ok(pool)
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues a batch and returns its pending handle.
    pub fn submit(&self, plan: &Arc<Plan>, batch_index: u64, batch_size: usize) -> SimResult<BatchHandle> {
        let (handle, completer) = BatchHandle::pending(batch_index);
        let job = Job::Execute {
            plan: Arc::clone(plan),
            batch_index,
            batch_size,
            completer,
        };
        let tx = self.tx.as_ref().ok_or(ClientError::BackendUnavailable {
            reason: "local pool is shut down".to_string(),
        })?;
        match tx.try_send(job) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => Err(SimError::Client(ClientError::QueueFull {
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(SimError::Client(ClientError::Disconnected { batch_index })),
        }
    }

    fn shutdown(&mut self) {
        // Close the queue: workers drain what is left, then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalPoolClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Execute {
                plan,
                batch_index,
                batch_size,
                completer,
            } => {
                if completer.is_cancelled() {
                    tracing::debug!(batch_index, "skipping cancelled batch");
                    continue;
                }
                let outcome = executor::execute(&plan, batch_index, batch_size).map_err(SimError::from);
                completer.complete(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::handle::wait_all;
    use crate::graph::{compile, ComputationContext, Input, ModelGraph, NodeRole, OpRef, OperationRegistry};

    fn plan() -> Arc<Plan> {
        let mut g = ModelGraph::new(Arc::new(OperationRegistry::standard())).with_context(ComputationContext::new(8, 1));
        g.add_node("x", OpRef::normal(0.0, 1.0), Vec::<Input>::new(), NodeRole::Stochastic)
            .unwrap();
        g.freeze().unwrap();
        Arc::new(compile(&g, &["x"]).unwrap())
    }

    #[test]
    fn zero_workers_is_unavailable() {
        let err = LocalPoolClient::start(&LocalPoolConfig {
            workers: 0,
            queue_capacity: 4,
        })
        .unwrap_err();
        assert!(matches!(err, SimError::Client(ClientError::BackendUnavailable { .. })));
    }

    #[test]
    fn pool_resolves_every_submitted_batch() {
        let pool = LocalPoolClient::start(&LocalPoolConfig {
            workers: 3,
            queue_capacity: 64,
        })
        .unwrap();
        let plan = plan();
        let mut handles: Vec<BatchHandle> = (0..20).map(|i| pool.submit(&plan, i, 8).unwrap()).collect();
        wait_all(&mut handles, Some(Duration::from_secs(10))).unwrap();

        let mut seen: Vec<u64> = handles
            .iter_mut()
            .map(|h| h.take().unwrap().unwrap().batch_index)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn pool_matches_direct_execution() {
        let pool = LocalPoolClient::start(&LocalPoolConfig {
            workers: 2,
            queue_capacity: 8,
        })
        .unwrap();
        let plan = plan();
        let mut handles = vec![pool.submit(&plan, 4, 8).unwrap()];
        wait_all(&mut handles, Some(Duration::from_secs(10))).unwrap();
        let pooled = handles[0].take().unwrap().unwrap();
        let direct = executor::execute(&plan, 4, 8).unwrap();
        assert_eq!(pooled, direct);
    }
}
