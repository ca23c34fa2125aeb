//! Batch handles and the handle-resolution boundary.
//!
//! A [`BatchHandle`] is the single consumer side of a one-shot channel; the
//! backend holds the matching [`Completer`]. The channel is the only point where
//! worker contexts and the owning thread synchronize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};

use crate::error::{ClientError, SimError, SimResult};
use crate::executor::BatchResult;

/// Eventual outcome of one batch.
pub type BatchOutcome = SimResult<BatchResult>;

/// Shared cancellation flag between a handle and its completer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Marks the batch cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Backend side of a pending handle. Resolves it at most once.
#[derive(Debug)]
pub struct Completer {
    batch_index: u64,
    tx: Sender<BatchOutcome>,
    cancel: CancelToken,
}

impl Completer {
    /// Batch this completer resolves.
    #[must_use]
    pub const fn batch_index(&self) -> u64 {
        self.batch_index
    }

    /// Returns true if the consumer cancelled the batch.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Delivers the outcome. Returns false if it was discarded because the
    /// batch was cancelled or the handle is gone.
    pub fn complete(self, outcome: BatchOutcome) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!(batch_index = self.batch_index, "discarding result of cancelled batch");
            return false;
        }
        self.tx.try_send(outcome).is_ok()
    }
}

/// Consumer side of one submitted batch.
#[derive(Debug)]
pub struct BatchHandle {
    batch_index: u64,
    rx: Receiver<BatchOutcome>,
    cancel: CancelToken,
    resolved: Option<BatchOutcome>,
    taken: bool,
}

impl BatchHandle {
    /// Creates a pending handle and its completer.
    #[must_use]
    pub fn pending(batch_index: u64) -> (Self, Completer) {
        let (tx, rx) = bounded::<BatchOutcome>(1);
        let cancel = CancelToken::default();
        let handle = Self {
            batch_index,
            rx,
            cancel: cancel.clone(),
            resolved: None,
            taken: false,
        };
        let completer = Completer {
            batch_index,
            tx,
            cancel,
        };
        (handle, completer)
    }

    /// Creates an already-resolved handle.
    #[must_use]
    pub fn resolved(batch_index: u64, outcome: BatchOutcome) -> Self {
        let (handle, completer) = Self::pending(batch_index);
        completer.complete(outcome);
        handle
    }

    /// Batch this handle represents.
    #[must_use]
    pub const fn batch_index(&self) -> u64 {
        self.batch_index
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Non-blocking check for a delivered outcome. Cancelled or already
    /// consumed handles never report done.
    pub fn is_done(&mut self) -> bool {
        if self.is_cancelled() || self.taken {
            return false;
        }
        if self.resolved.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.resolved = Some(outcome),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.resolved = Some(Err(self.lost())),
            }
        }
        self.resolved.is_some()
    }

    /// Cancels the batch. Any outcome, delivered or not, is discarded.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.resolved = None;
    }

    /// Takes the outcome if resolved and not cancelled.
    pub fn take(&mut self) -> Option<BatchOutcome> {
        if self.is_done() {
            self.taken = true;
            self.resolved.take()
        } else {
            None
        }
    }

    fn lost(&self) -> SimError {
        SimError::Client(ClientError::Disconnected {
            batch_index: self.batch_index,
        })
    }

    fn waitable(&self) -> bool {
        !self.is_cancelled() && !self.taken && self.resolved.is_none()
    }
}

fn timeout_error(timeout: Duration) -> SimError {
    SimError::Client(ClientError::Timeout {
        duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
    })
}

/// Blocks until at least one handle resolves and returns the positions of
/// every resolved, uncancelled handle.
///
/// Returns an empty list when nothing is left to wait for. With a timeout,
/// fails with `ClientError::Timeout` if nothing resolves in time.
pub fn wait_any(handles: &mut [BatchHandle], timeout: Option<Duration>) -> SimResult<Vec<usize>> {
    let ready = ready_positions(handles);
    if !ready.is_empty() {
        return Ok(ready);
    }
    block_on_one(handles, timeout)?;
    Ok(ready_positions(handles))
}

/// Blocks until every uncancelled handle has resolved.
pub fn wait_all(handles: &mut [BatchHandle], timeout: Option<Duration>) -> SimResult<()> {
    let deadline = timeout.map(|t| (t, Instant::now() + t));
    loop {
        ready_positions(handles);
        let remaining = handles.iter().filter(|h| h.waitable()).count();
        if remaining == 0 {
            return Ok(());
        }
        let budget = match deadline {
            Some((t, deadline)) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(timeout_error(t));
                }
                Some(left)
            }
            None => None,
        };
        tracing::trace!(remaining, "waiting for outstanding batches");
        if let Err(e) = block_on_one(handles, budget) {
            return Err(match (e, deadline) {
                (SimError::Client(ClientError::Timeout { .. }), Some((t, _))) => timeout_error(t),
                (e, _) => e,
            });
        }
    }
}

/// Waits on the unresolved handles until one of them receives its outcome.
fn block_on_one(handles: &mut [BatchHandle], timeout: Option<Duration>) -> SimResult<()> {
    let candidates: Vec<usize> = (0..handles.len()).filter(|&i| handles[i].waitable()).collect();
    if candidates.is_empty() {
        return Ok(());
    }

    let (winner, received) = {
        let mut select = Select::new();
        for &i in &candidates {
            select.recv(&handles[i].rx);
        }
        let op = match timeout {
            Some(t) => select.select_timeout(t).map_err(|_| timeout_error(t))?,
            None => select.select(),
        };
        let winner = candidates[op.index()];
        let received = op.recv(&handles[winner].rx);
        (winner, received)
    };

    let outcome = match received {
        Ok(outcome) => outcome,
        Err(_) => Err(handles[winner].lost()),
    };
    handles[winner].resolved = Some(outcome);
    Ok(())
}

fn ready_positions(handles: &mut [BatchHandle]) -> Vec<usize> {
    handles
        .iter_mut()
        .enumerate()
        .filter_map(|(i, h)| h.is_done().then_some(i))
        .collect()
}
