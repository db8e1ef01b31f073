//! Collective communication between data-parallel workers
//!
//! The preconditioner only needs an all-reduce. Reductions are issued with
//! [`Communicator::allreduce_async`] for every buffer of a round and then
//! completed with [`Communicator::synchronize`], so a backend can overlap them.

pub mod thread_group;

pub use thread_group::{ThreadCommunicator, ThreadGroup};

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use crate::config::CommBackend;
use crate::error::{Error, Result};

/// Reduction applied across workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum
    Sum,
    /// Element-wise mean
    Average,
}

/// Pending reduction, completed by [`Communicator::synchronize`]
#[derive(Debug)]
pub struct ReduceHandle {
    pub(crate) state: HandleState,
}

#[derive(Debug)]
pub(crate) enum HandleState {
    Ready(Tensor),
    Pending { seq: u64, op: ReduceOp },
}

impl ReduceHandle {
    pub(crate) fn ready(tensor: Tensor) -> Self {
        Self {
            state: HandleState::Ready(tensor),
        }
    }

    pub(crate) fn pending(seq: u64, op: ReduceOp) -> Self {
        Self {
            state: HandleState::Pending { seq, op },
        }
    }
}

/// All-reduce across the workers of one data-parallel group.
///
/// Every rank must issue the same reductions in the same order.
pub trait Communicator: Send + Sync + fmt::Debug {
    /// Rank of this worker
    fn rank(&self) -> usize;

    /// Number of workers
    fn size(&self) -> usize;

    /// Start a reduction of `tensor`
    fn allreduce_async(&self, tensor: &Tensor, op: ReduceOp) -> Result<ReduceHandle>;

    /// Wait for a reduction and return its result
    fn synchronize(&self, handle: ReduceHandle) -> Result<Tensor>;

    /// Blocking reduction
    fn allreduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let handle = self.allreduce_async(tensor, op)?;
        self.synchronize(handle)
    }

    /// Blocking element-wise mean
    fn allreduce_average(&self, tensor: &Tensor) -> Result<Tensor> {
        self.allreduce(tensor, ReduceOp::Average)
    }

    /// Blocking element-wise sum
    fn allreduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        self.allreduce(tensor, ReduceOp::Sum)
    }
}

/// Single-worker communicator; every reduction is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_async(&self, tensor: &Tensor, _op: ReduceOp) -> Result<ReduceHandle> {
        Ok(ReduceHandle::ready(tensor.clone()))
    }

    fn synchronize(&self, handle: ReduceHandle) -> Result<Tensor> {
        match handle.state {
            HandleState::Ready(tensor) => Ok(tensor),
            HandleState::Pending { seq, .. } => Err(Error::communication(format!(
                "local communicator cannot complete foreign reduction #{}",
                seq
            ))),
        }
    }
}

/// One communicator per rank for the configured backend
pub fn build_communicators(backend: &CommBackend) -> Vec<Arc<dyn Communicator>> {
    match backend {
        CommBackend::Local => vec![Arc::new(LocalCommunicator)],
        CommBackend::Threads { workers } => ThreadGroup::new(*workers)
            .into_iter()
            .map(|comm| Arc::new(comm) as Arc<dyn Communicator>)
            .collect(),
    }
}
