//! K-FAC preconditioning engine
//!
//! [`Kfac`] owns the per-layer factor arena and drives one preconditioning
//! step per training iteration. Call [`Kfac::step`] after `loss.backward()`
//! and before the base optimizer consumes the gradients:
//!
//! 1. every `fac_update_freq` steps the captured tensors become factor
//!    estimates that are blended into the running averages (and averaged
//!    across workers);
//! 2. every `kfac_update_freq` steps the eigenbases are recomputed block by
//!    block (and summed across workers);
//! 3. every step each registered layer's gradient is preconditioned and the
//!    rescaled result is written back into the `GradStore`.

use std::sync::Arc;

use candle_core::backprop::GradStore;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::comm::{Communicator, LocalCommunicator, ReduceHandle, ReduceOp};
use crate::config::KfacConfig;
use crate::eigen::{decompose_blocks, RankCycle};
use crate::error::{Error, Result};
use crate::factors::{compute_a, compute_g, FactorSide, LayerState};
use crate::layers::{HookManager, KfacModel, LayerHandle, LayerId, LayerRegistry};
use crate::precondition::{format_grad, precondition, split_grad};
use crate::rescale::{LayerUpdate, Rescaler};

/// Hyperparameters that may change during training
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HyperParams {
    /// Learning rate
    pub lr: f64,
    /// Tikhonov damping
    pub damping: f64,
    /// Iterations between factor updates
    pub fac_update_freq: usize,
    /// Iterations between eigendecompositions
    pub kfac_update_freq: usize,
}

impl HyperParams {
    fn from_config(config: &KfacConfig) -> Self {
        Self {
            lr: config.lr,
            damping: config.damping,
            fac_update_freq: config.fac_update_freq,
            kfac_update_freq: config.kfac_update_freq,
        }
    }
}

/// Diagnostics of one preconditioning step
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepStats {
    /// Step index, starting at 0
    pub step: usize,
    /// Whether the factors were refreshed
    pub factors_updated: bool,
    /// Whether the eigenbases were recomputed
    pub eigen_updated: bool,
    /// Rescale factor; the unit clip ratio for the per-unit strategies
    pub nu: f64,
    /// Global norm of the raw gradients
    pub pre_norm: f64,
    /// Global norm of the gradients written back
    pub post_norm: f64,
    /// Sum of the Frobenius norms of every `QA`
    pub eigvec_a_norm: f64,
    /// Sum of the Frobenius norms of every `QG`
    pub eigvec_g_norm: f64,
    /// Sum of the norms of the weight unit norms
    pub weight_unit_norm: f64,
    /// Sum of the norms of the corrected-gradient unit norms
    pub grad_unit_norm: f64,
}

/// Ranks owning each diagonal block of a layer's factors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockAssignment {
    /// Owners of the `A` blocks
    pub a: Vec<usize>,
    /// Owners of the `G` blocks
    pub g: Vec<usize>,
}

/// K-FAC gradient preconditioner
pub struct Kfac {
    config: KfacConfig,
    params: HyperParams,
    registry: LayerRegistry,
    hooks: HookManager,
    /// Factor arena indexed by [`LayerId`]
    states: Vec<LayerState>,
    comm: Arc<dyn Communicator>,
    rank_cycle: RankCycle,
    rescaler: Rescaler,
    distribute_layer_factors: bool,
    steps: usize,
    have_cleared_eigen: bool,
    eigen_clears: usize,
    warned_missing_epoch: bool,
    assignments: Vec<BlockAssignment>,
}

impl std::fmt::Debug for Kfac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kfac")
            .field("params", &self.params)
            .field("layers", &self.registry.len())
            .field("rank", &self.comm.rank())
            .field("world_size", &self.comm.size())
            .field("steps", &self.steps)
            .finish()
    }
}

impl Kfac {
    /// Register `model`'s layers with a single-worker communicator
    pub fn new<M: KfacModel + ?Sized>(model: &mut M, config: KfacConfig) -> Result<Self> {
        let workers = config.comm.world_size();
        if workers > 1 {
            return Err(Error::config(format!(
                "configuration asks for {} workers; build one communicator per worker and use Kfac::with_communicator",
                workers
            )));
        }
        Self::with_communicator(model, config, Arc::new(LocalCommunicator))
    }

    /// Register `model`'s layers for the worker behind `comm`
    #[instrument(skip(model, config, comm), fields(rank = comm.rank(), world_size = comm.size()))]
    pub fn with_communicator<M: KfacModel + ?Sized>(
        model: &mut M,
        config: KfacConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        config.validate()?;
        for note in config.advisories() {
            warn!("{}", note);
        }

        let hooks = HookManager::new(config.fac_update_freq);
        let registry = LayerRegistry::build(model, &config.layer_kinds, &hooks)?;
        if registry.is_empty() {
            warn!("No supported layers found; K-FAC steps will leave gradients untouched");
        }

        let distribute_layer_factors = config
            .distribute_layer_factors
            .unwrap_or(comm.size() > registry.len());

        info!(
            "K-FAC registered {} layers (rank {}/{}, distribute_layer_factors={})",
            registry.len(),
            comm.rank(),
            comm.size(),
            distribute_layer_factors
        );

        Ok(Self {
            params: HyperParams::from_config(&config),
            states: vec![LayerState::default(); registry.len()],
            rank_cycle: RankCycle::new(comm.size()),
            rescaler: Rescaler::from_config(&config),
            have_cleared_eigen: config.diag_warmup == 0,
            assignments: vec![BlockAssignment::default(); registry.len()],
            distribute_layer_factors,
            registry,
            hooks,
            comm,
            config,
            steps: 0,
            eigen_clears: 0,
            warned_missing_epoch: false,
        })
    }

    /// Run one preconditioning step over the gradients in `grads`.
    ///
    /// `epoch` decides when the diagonal-block warm-up ends.
    #[instrument(skip(self, grads), fields(step = self.steps))]
    pub fn step(&mut self, grads: &mut GradStore, epoch: Option<usize>) -> Result<StepStats> {
        let mut stats = StepStats {
            step: self.steps,
            ..Default::default()
        };

        let diag_blocks = match epoch {
            Some(e) if e >= self.config.diag_warmup => self.config.diag_blocks,
            Some(_) => 1,
            None => {
                if self.config.diag_warmup > 0 && !self.warned_missing_epoch {
                    warn!("diag_warmup > 0 but no epoch was passed to step(); skipping the warm-up");
                    self.warned_missing_epoch = true;
                }
                self.config.diag_blocks
            }
        };

        self.hooks.collect_grad_outputs(grads);

        if self.steps % self.params.fac_update_freq == 0 {
            self.update_factors()?;
            stats.factors_updated = true;
        }

        if self.steps % self.params.kfac_update_freq == 0 {
            let warm_up_over = matches!(epoch, Some(e) if e >= self.config.diag_warmup);
            if !self.have_cleared_eigen && warm_up_over {
                self.clear_eigen()?;
            }
            self.update_eigen(diag_blocks)?;
            stats.eigen_updated = true;
        }

        let updates = self.precondition_all(grads)?;
        self.rescaler.apply(
            self.registry.layers(),
            &self.states,
            &updates,
            self.params.lr,
            grads,
            &mut stats,
        )?;

        self.steps += 1;
        self.hooks.sync(self.steps, self.params.fac_update_freq);
        Ok(stats)
    }

    fn update_factors(&mut self) -> Result<()> {
        let decay = self.config.factor_decay;

        for layer in self.registry.layers() {
            let sample = self.hooks.take_sample(layer.id());
            let input = sample
                .input
                .ok_or_else(|| Error::missing_capture(layer.name(), FactorSide::A))?;
            let grad_output = sample
                .grad_output
                .ok_or_else(|| Error::missing_capture(layer.name(), FactorSide::G))?;

            let a = compute_a(&input, layer)?;
            let g = compute_g(&grad_output, layer, self.config.batch_averaged)?;
            let state = &mut self.states[layer.id()];
            state.blend(FactorSide::A, &a, decay)?;
            state.blend(FactorSide::G, &g, decay)?;
        }

        if self.comm.size() > 1 {
            self.allreduce_factors()?;
        }
        debug!("Updated factors for {} layers", self.registry.len());
        Ok(())
    }

    fn allreduce_factors(&mut self) -> Result<()> {
        let mut handles: Vec<(LayerId, FactorSide, ReduceHandle)> = Vec::new();
        for layer in self.registry.layers() {
            let state = &self.states[layer.id()];
            for side in FactorSide::BOTH {
                let factor = state.require(side, layer.name())?.factor();
                handles.push((
                    layer.id(),
                    side,
                    self.comm.allreduce_async(factor, ReduceOp::Average)?,
                ));
            }
        }

        for (id, side, handle) in handles {
            let reduced = self.comm.synchronize(handle)?;
            if let Some(state) = self.states[id].side_mut(side) {
                state.factor = reduced;
            }
        }
        Ok(())
    }

    fn clear_eigen(&mut self) -> Result<()> {
        for state in &mut self.states {
            for side in FactorSide::BOTH {
                if let Some(factor) = state.side_mut(side) {
                    factor.clear_eigen()?;
                }
            }
        }
        self.have_cleared_eigen = true;
        self.eigen_clears += 1;
        info!("Diagonal-block warm-up over; cleared eigendecompositions");
        Ok(())
    }

    fn update_eigen(&mut self, diag_blocks: usize) -> Result<()> {
        let rank = self.comm.rank();
        let eps = self.config.eigen_eps;
        let mut computed = 0;

        // Same ranks get the same layers every round
        self.rank_cycle.reset();

        for layer in self.registry.layers() {
            let n = layer.kind().diag_blocks(diag_blocks);
            let ranks_a = self.rank_cycle.next(n);
            let ranks_g = if self.distribute_layer_factors {
                self.rank_cycle.next(n)
            } else {
                ranks_a.clone()
            };

            let state = &mut self.states[layer.id()];
            for (side, ranks) in [(FactorSide::A, &ranks_a), (FactorSide::G, &ranks_g)] {
                let factor = state.side_mut(side).ok_or_else(|| {
                    Error::internal(format!(
                        "layer '{}' has no {} factor; the first step must be a factor update",
                        layer.name(),
                        side
                    ))
                })?;
                computed += decompose_blocks(factor, ranks, rank, eps)?;
            }
            self.assignments[layer.id()] = BlockAssignment {
                a: ranks_a,
                g: ranks_g,
            };
        }

        if self.comm.size() > 1 {
            self.allreduce_eigen()?;
        }
        debug!("Rank {} computed {} eigen blocks", rank, computed);
        Ok(())
    }

    fn allreduce_eigen(&mut self) -> Result<()> {
        // (layer, side, is_vectors, handle)
        let mut handles: Vec<(LayerId, FactorSide, bool, ReduceHandle)> = Vec::new();
        for layer in self.registry.layers() {
            let state = &self.states[layer.id()];
            for side in FactorSide::BOTH {
                let factor = state.require(side, layer.name())?;
                handles.push((
                    layer.id(),
                    side,
                    true,
                    self.comm.allreduce_async(factor.eigenvectors(), ReduceOp::Sum)?,
                ));
                handles.push((
                    layer.id(),
                    side,
                    false,
                    self.comm.allreduce_async(factor.eigenvalues(), ReduceOp::Sum)?,
                ));
            }
        }

        for (id, side, is_vectors, handle) in handles {
            let reduced = self.comm.synchronize(handle)?;
            if let Some(state) = self.states[id].side_mut(side) {
                if is_vectors {
                    state.eigenvectors = reduced;
                } else {
                    state.eigenvalues = reduced;
                }
            }
        }
        Ok(())
    }

    fn precondition_all(&self, grads: &GradStore) -> Result<Vec<LayerUpdate>> {
        let damping = self.params.damping;
        let mut updates = Vec::with_capacity(self.registry.len());

        for layer in self.registry.layers() {
            let raw_weight = grads
                .get(layer.weight().as_tensor())
                .cloned()
                .ok_or_else(|| missing_grad(layer, "weight"))?;
            let raw_bias = match layer.bias() {
                Some(bias) => Some(
                    grads
                        .get(bias.as_tensor())
                        .cloned()
                        .ok_or_else(|| missing_grad(layer, "bias"))?,
                ),
                None => None,
            };

            let state = &self.states[layer.id()];
            let a = state.require(FactorSide::A, layer.name())?;
            let g = state.require(FactorSide::G, layer.name())?;

            let grad = format_grad(layer, &raw_weight, raw_bias.as_ref())?;
            let v = precondition(&grad, a, g, damping)?;
            let corrected = split_grad(&v, layer)?;
            updates.push(LayerUpdate {
                raw_weight,
                raw_bias,
                corrected,
            });
        }
        Ok(updates)
    }

    /// Hook manager shared with the registered layers
    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    /// Registered layers in registry order
    pub fn layers(&self) -> &[LayerHandle] {
        self.registry.layers()
    }

    /// Current hyperparameters
    pub fn hyperparams(&self) -> HyperParams {
        self.params
    }

    /// Follow the base optimizer's learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    /// Completed preconditioning steps
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Factor state of a layer
    pub fn layer_state(&self, id: LayerId) -> Option<&LayerState> {
        self.states.get(id)
    }

    /// Block owners of a layer from the last eigen round
    pub fn block_assignment(&self, id: LayerId) -> Option<&BlockAssignment> {
        self.assignments.get(id)
    }

    /// Number of times the eigenbuffers were cleared
    pub fn eigen_clears(&self) -> usize {
        self.eigen_clears
    }

    /// Whether `A` and `G` of one layer go to different ranks
    pub fn distributes_layer_factors(&self) -> bool {
        self.distribute_layer_factors
    }

    /// Configuration the engine was built with
    pub fn config(&self) -> &KfacConfig {
        &self.config
    }

    /// Communicator of this worker
    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub(crate) fn apply_schedule(
        &mut self,
        damping: f64,
        fac_update_freq: usize,
        kfac_update_freq: usize,
    ) {
        self.params.damping = damping;
        self.params.fac_update_freq = fac_update_freq.max(1);
        self.params.kfac_update_freq = kfac_update_freq.max(1);
        self.hooks.sync(self.steps, self.params.fac_update_freq);
    }
}

fn missing_grad(layer: &LayerHandle, param: &str) -> Error {
    Error::shape(format!(
        "layer '{}' has no {} gradient in the gradient store",
        layer.name(),
        param
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommBackend, GradientRescale};
    use crate::layers::{Linear, TrainableLayer};
    use candle_core::{Device, Module, Tensor};

    struct Mlp {
        fc1: Linear,
        fc2: Linear,
    }

    impl KfacModel for Mlp {
        fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
            vec![&mut self.fc1, &mut self.fc2]
        }
    }

    impl Mlp {
        fn new(device: &Device) -> Self {
            Self {
                fc1: Linear::init("fc1", 3, 4, true, device).unwrap(),
                fc2: Linear::init("fc2", 4, 2, false, device).unwrap(),
            }
        }

        fn forward(&self, x: &Tensor) -> Tensor {
            let h = self.fc1.forward(x).unwrap().relu().unwrap();
            self.fc2.forward(&h).unwrap()
        }
    }

    fn config() -> KfacConfig {
        KfacConfig {
            fac_update_freq: 1,
            kfac_update_freq: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_multi_worker_config() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let config = KfacConfig {
            comm: CommBackend::Threads { workers: 2 },
            ..Default::default()
        };
        assert!(matches!(Kfac::new(&mut model, config), Err(Error::Config(_))));
    }

    #[test]
    fn test_new_validates_config() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let config = KfacConfig {
            damping: 0.0,
            ..Default::default()
        };
        assert!(Kfac::new(&mut model, config).is_err());
    }

    #[test]
    fn test_single_worker_defaults() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let kfac = Kfac::new(&mut model, config()).unwrap();
        assert_eq!(kfac.layers().len(), 2);
        assert!(!kfac.distributes_layer_factors());
        assert_eq!(kfac.hyperparams().fac_update_freq, 1);
        assert!(kfac.layer_state(0).unwrap().a.is_none());
    }

    #[test]
    fn test_step_fills_arena_and_writes_gradients() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let mut kfac = Kfac::new(&mut model, config()).unwrap();

        let x = Tensor::arange(0f32, 15., &device)
            .unwrap()
            .reshape((5, 3))
            .unwrap()
            .affine(0.1, -0.5)
            .unwrap();
        let loss = model.forward(&x).sqr().unwrap().mean_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let raw_bias = grads
            .get(model.fc1.bias().unwrap().as_tensor())
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let stats = kfac.step(&mut grads, None).unwrap();
        assert_eq!(stats.step, 0);
        assert!(stats.factors_updated && stats.eigen_updated);
        assert_eq!(kfac.steps(), 1);
        assert_eq!(kfac.hooks().steps(), 1);

        let state = kfac.layer_state(0).unwrap();
        assert_eq!(state.a.as_ref().unwrap().dim(), 4);
        assert_eq!(state.g.as_ref().unwrap().dim(), 4);
        let written = grads.get(model.fc1.weight().as_tensor()).unwrap();
        assert_eq!(written.dims(), &[4, 3]);

        // the adaptive strategy leaves the raw bias gradient in place
        let bias = grads
            .get(model.fc1.bias().unwrap().as_tensor())
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(bias, raw_bias);
    }

    #[test]
    fn test_apply_schedule_moves_capture_window() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let mut kfac = Kfac::new(&mut model, config()).unwrap();
        kfac.apply_schedule(0.01, 3, 0);

        let params = kfac.hyperparams();
        assert_eq!(params.damping, 0.01);
        assert_eq!(params.fac_update_freq, 3);
        assert_eq!(params.kfac_update_freq, 1);
        assert!(kfac.hooks().is_capture_step());
    }

    #[test]
    fn test_distribution_follows_world_size() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);

        let mut three = crate::comm::ThreadGroup::new(3);
        let comm: Arc<dyn Communicator> = Arc::new(three.remove(0));
        let kfac = Kfac::with_communicator(&mut model, config(), comm).unwrap();
        assert!(kfac.distributes_layer_factors());
        assert_eq!(kfac.communicator().size(), 3);
        assert_eq!(kfac.communicator().rank(), 0);

        let mut two = crate::comm::ThreadGroup::new(2);
        let comm: Arc<dyn Communicator> = Arc::new(two.remove(0));
        let kfac = Kfac::with_communicator(&mut model, config(), comm).unwrap();
        assert!(!kfac.distributes_layer_factors());

        let pinned = KfacConfig {
            distribute_layer_factors: Some(true),
            ..config()
        };
        let kfac = Kfac::new(&mut model, pinned).unwrap();
        assert!(kfac.distributes_layer_factors());
        assert_eq!(kfac.communicator().size(), 1);
    }

    #[test]
    fn test_rescaler_follows_config() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let kfac = Kfac::new(&mut model, config()).unwrap();
        assert_eq!(kfac.rescaler.strategy(), GradientRescale::Adaptive);

        let global = KfacConfig {
            gradient_rescale: GradientRescale::GlobalKl,
            ..config()
        };
        let kfac = Kfac::new(&mut model, global).unwrap();
        assert_eq!(kfac.rescaler.strategy(), GradientRescale::GlobalKl);
    }

    #[test]
    fn test_non_finite_kl_sum_is_an_error() {
        let device = Device::Cpu;
        let mut model = Mlp::new(&device);
        let config = KfacConfig {
            gradient_rescale: GradientRescale::GlobalKl,
            ..config()
        };
        let mut kfac = Kfac::new(&mut model, config).unwrap();

        let x = Tensor::ones((2, 3), candle_core::DType::F32, &device).unwrap();
        let loss = model.forward(&x).sqr().unwrap().mean_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let nan = Tensor::full(f32::NAN, (2, 4), &device).unwrap();
        grads.insert(model.fc2.weight().as_tensor(), nan);

        assert!(matches!(kfac.step(&mut grads, None), Err(Error::Internal(_))));
    }
}
