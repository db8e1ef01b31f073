//! Activation and output-gradient capture
//!
//! Every registered layer holds a [`CaptureHook`] that shares one capture
//! buffer with the [`HookManager`] owned by the preconditioner.
//!
//! - Pre-forward: [`CaptureHook::save_input`] stores the layer input when
//!   gradient tracking is on and the step is a factor-update step.
//! - Post-backward: candle drops gradients of intermediate tensors, so on
//!   factor-update steps [`CaptureHook::track_output`] adds a zero-valued probe
//!   variable to the layer output. The probe's gradient equals the gradient
//!   w.r.t. the output and is collected from the `GradStore` after
//!   `loss.backward()` by [`HookManager::collect_grad_outputs`].
//!
//! Hooks run on the thread doing the forward/backward pass and must not run
//! concurrently with a preconditioning step.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use parking_lot::Mutex;
use tracing::trace;

use super::LayerId;

/// Tensors captured for one layer during one factor-update window
#[derive(Debug, Default)]
pub struct CapturedSample {
    /// Layer input
    pub input: Option<Tensor>,
    /// Gradient w.r.t. the layer output
    pub grad_output: Option<Tensor>,
}

#[derive(Debug, Default)]
struct Slot {
    sample: CapturedSample,
    probe: Option<Var>,
}

#[derive(Debug)]
struct CaptureState {
    steps: usize,
    fac_update_freq: usize,
    grad_enabled: bool,
    slots: Vec<Slot>,
}

impl CaptureState {
    fn is_capture_step(&self) -> bool {
        self.steps % self.fac_update_freq == 0
    }
}

/// Owner of the per-layer capture buffers
#[derive(Debug, Clone)]
pub struct HookManager {
    state: Arc<Mutex<CaptureState>>,
}

impl HookManager {
    /// Create a manager at step 0
    pub fn new(fac_update_freq: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState {
                steps: 0,
                fac_update_freq: fac_update_freq.max(1),
                grad_enabled: true,
                slots: Vec::new(),
            })),
        }
    }

    /// Allocate a capture slot and hand out the hook that writes into it
    pub(crate) fn attach(&self) -> CaptureHook {
        let mut state = self.state.lock();
        let id = state.slots.len();
        state.slots.push(Slot::default());
        CaptureHook {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Number of attached hooks
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Enable or disable gradient tracking for input capture
    pub fn set_grad_enabled(&self, enabled: bool) {
        self.state.lock().grad_enabled = enabled;
    }

    /// Whether gradient tracking is enabled
    pub fn is_grad_enabled(&self) -> bool {
        self.state.lock().grad_enabled
    }

    /// Disable gradient tracking until the returned guard is dropped
    pub fn no_grad(&self) -> NoGradGuard {
        let mut state = self.state.lock();
        let previous = state.grad_enabled;
        state.grad_enabled = false;
        NoGradGuard {
            state: Arc::clone(&self.state),
            previous,
        }
    }

    /// Whether the current step captures tensors
    pub fn is_capture_step(&self) -> bool {
        self.state.lock().is_capture_step()
    }

    /// Step counter as seen by the hooks
    pub fn steps(&self) -> usize {
        self.state.lock().steps
    }

    pub(crate) fn sync(&self, steps: usize, fac_update_freq: usize) {
        let mut state = self.state.lock();
        state.steps = steps;
        state.fac_update_freq = fac_update_freq.max(1);
    }

    /// Move probe gradients out of `grads` into the capture slots.
    ///
    /// Returns the number of layers whose output gradient was captured.
    pub fn collect_grad_outputs(&self, grads: &mut GradStore) -> usize {
        let mut state = self.state.lock();
        let capture = state.is_capture_step();
        let mut collected = 0;

        for (id, slot) in state.slots.iter_mut().enumerate() {
            let Some(probe) = slot.probe.take() else {
                continue;
            };
            if let Some(grad) = grads.remove(probe.as_tensor()) {
                if capture {
                    slot.sample.grad_output = Some(grad);
                    collected += 1;
                    trace!("Captured output gradient for layer #{}", id);
                }
            }
        }
        collected
    }

    /// Take the captured tensors of a layer, leaving its slot empty
    pub(crate) fn take_sample(&self, id: LayerId) -> CapturedSample {
        let mut state = self.state.lock();
        state
            .slots
            .get_mut(id)
            .map(|slot| std::mem::take(&mut slot.sample))
            .unwrap_or_default()
    }

    /// Whether a layer currently holds a captured input
    pub fn has_input(&self, id: LayerId) -> bool {
        self.state
            .lock()
            .slots
            .get(id)
            .is_some_and(|slot| slot.sample.input.is_some())
    }

    /// Whether a layer currently holds a captured output gradient
    pub fn has_grad_output(&self, id: LayerId) -> bool {
        self.state
            .lock()
            .slots
            .get(id)
            .is_some_and(|slot| slot.sample.grad_output.is_some())
    }
}

/// Capture points attached to one registered layer
#[derive(Debug, Clone)]
pub struct CaptureHook {
    id: LayerId,
    state: Arc<Mutex<CaptureState>>,
}

impl CaptureHook {
    /// Id of the layer this hook belongs to
    pub fn layer_id(&self) -> LayerId {
        self.id
    }

    /// Pre-forward capture of the layer input
    pub fn save_input(&self, input: &Tensor) {
        let mut state = self.state.lock();
        if state.grad_enabled && state.is_capture_step() {
            if let Some(slot) = state.slots.get_mut(self.id) {
                slot.sample.input = Some(input.detach());
            }
        }
    }

    /// Route the layer output through a gradient probe on capture steps
    pub fn track_output(&self, output: Tensor) -> candle_core::Result<Tensor> {
        let mut state = self.state.lock();
        if !state.is_capture_step() {
            return Ok(output);
        }
        let Some(slot) = state.slots.get_mut(self.id) else {
            return Ok(output);
        };
        let probe = Var::zeros(output.shape().clone(), output.dtype(), output.device())?;
        let tracked = output.add(probe.as_tensor())?;
        slot.probe = Some(probe);
        Ok(tracked)
    }
}

/// Restores the previous gradient-tracking flag on drop
#[derive(Debug)]
pub struct NoGradGuard {
    state: Arc<Mutex<CaptureState>>,
    previous: bool,
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        self.state.lock().grad_enabled = self.previous;
    }
}
