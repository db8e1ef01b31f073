//! In-process collective across worker threads
//!
//! Each rank numbers its reductions with a local sequence counter. Since all
//! ranks issue the same reductions in the same order, equal sequence numbers
//! refer to the same collective. Contributions accumulate in a shared slot; a
//! rank synchronizing on a slot waits until every rank has contributed, and the
//! last rank to collect removes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::Tensor;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{Communicator, HandleState, ReduceHandle, ReduceOp};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Slot {
    sum: Option<Tensor>,
    contributed: usize,
    collected: usize,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    slots: Mutex<HashMap<u64, Slot>>,
    ready: Condvar,
}

/// Factory for the communicators of one thread group
#[derive(Debug)]
pub struct ThreadGroup;

impl ThreadGroup {
    /// Communicators for ranks `0..size`, to be moved into one thread each
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<ThreadCommunicator> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            size,
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadCommunicator {
                rank,
                shared: Arc::clone(&shared),
                next_seq: AtomicU64::new(0),
            })
            .collect()
    }
}

/// Rank-local end of a [`ThreadGroup`]
#[derive(Debug)]
pub struct ThreadCommunicator {
    rank: usize,
    shared: Arc<Shared>,
    next_seq: AtomicU64,
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn allreduce_async(&self, tensor: &Tensor, op: ReduceOp) -> Result<ReduceHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.shared.slots.lock();
        let slot = slots.entry(seq).or_default();

        if let Some(sum) = &slot.sum {
            if sum.dims() != tensor.dims() {
                return Err(Error::communication(format!(
                    "rank {} reduced shape {:?} in collective #{} where others sent {:?}",
                    self.rank,
                    tensor.dims(),
                    seq,
                    sum.dims()
                )));
            }
        }
        slot.sum = Some(match slot.sum.take() {
            Some(sum) => (sum + tensor)?,
            None => tensor.clone(),
        });
        slot.contributed += 1;
        trace!("Rank {} contributed to collective #{}", self.rank, seq);

        if slot.contributed == self.shared.size {
            self.shared.ready.notify_all();
        }
        Ok(ReduceHandle::pending(seq, op))
    }

    fn synchronize(&self, handle: ReduceHandle) -> Result<Tensor> {
        let (seq, op) = match handle.state {
            HandleState::Ready(tensor) => return Ok(tensor),
            HandleState::Pending { seq, op } => (seq, op),
        };

        let mut slots = self.shared.slots.lock();
        loop {
            let complete = match slots.get(&seq) {
                Some(slot) => slot.contributed >= self.shared.size,
                None => {
                    return Err(Error::communication(format!(
                        "collective #{} is unknown to rank {}",
                        seq, self.rank
                    )))
                }
            };
            if complete {
                break;
            }
            self.shared.ready.wait(&mut slots);
        }

        let size = self.shared.size;
        let slot = slots
            .get_mut(&seq)
            .ok_or_else(|| Error::communication(format!("collective #{} vanished", seq)))?;
        let sum = slot
            .sum
            .clone()
            .ok_or_else(|| Error::communication(format!("collective #{} has no data", seq)))?;
        slot.collected += 1;
        if slot.collected == size {
            slots.remove(&seq);
        }
        drop(slots);

        match op {
            ReduceOp::Sum => Ok(sum),
            ReduceOp::Average => Ok(sum.affine(1.0 / size as f64, 0.0)?),
        }
    }
}
