//! Gradient rescaling after preconditioning
//!
//! Preconditioned gradients can be much larger than the raw ones, so they are
//! bounded before being written back into the gradient store:
//!
//! - [`GradientRescale::GlobalKl`] scales every corrected gradient by one
//!   factor `nu` that bounds the quadratic-model change in loss.
//! - [`GradientRescale::Adaptive`] clips each unit (row or column) of the
//!   corrected weight gradient against the norm of the same unit of the weight.
//! - [`GradientRescale::KroneckerNorm`] clips rows against the row norms of
//!   `QG` and then columns against the column norms of `QA`.

use candle_core::backprop::GradStore;
use candle_core::Tensor;
use tracing::{debug, warn};

use crate::config::{GradientRescale, KfacConfig};
use crate::error::{Error, Result};
use crate::factors::{FactorSide, LayerState};
use crate::layers::LayerHandle;
use crate::optimizer::StepStats;
use crate::precondition::PreconditionedGrad;
use crate::utils::tensor::{as_matrix, cap_at, floor_at, frobenius_norm, sum_f64};

/// Floor on gradient unit norms before dividing by them
const GRAD_NORM_FLOOR: f64 = 1e-6;

/// Raw and corrected gradients of one layer
#[derive(Debug, Clone)]
pub struct LayerUpdate {
    /// Raw weight gradient, weight-shaped
    pub raw_weight: Tensor,
    /// Raw bias gradient, bias-shaped
    pub raw_bias: Option<Tensor>,
    /// Preconditioned gradient
    pub corrected: PreconditionedGrad,
}

/// KL-clip scale `min(1, sqrt(kl_clip / |vg_sum|))`; 1 when `vg_sum` is zero.
///
/// Callers must reject a non-finite `vg_sum` first.
pub fn kl_clip_scale(vg_sum: f64, kl_clip: f64) -> f64 {
    if vg_sum == 0.0 || !vg_sum.is_finite() {
        return 1.0;
    }
    (kl_clip / vg_sum.abs()).sqrt().min(1.0)
}

/// Norm of every row (`row_major`) or column of a matrix.
///
/// Row norms are shaped `(rows, 1)`, column norms `(1, cols)`.
pub fn unitwise_norm(x: &Tensor, row_major: bool) -> Result<Tensor> {
    let x = as_matrix(x)?;
    let axis = if row_major { 1 } else { 0 };
    Ok(x.sqr()?.sum_keepdim(axis)?.sqrt()?)
}

/// Rescale each unit of `grad` so its norm is at most `clip · max(|reference unit|, eps)`
pub fn clip_units(
    grad: &Tensor,
    reference: &Tensor,
    row_major: bool,
    eps: f64,
    clip: f64,
) -> Result<Tensor> {
    let grad = as_matrix(grad)?;
    let g_norm = unitwise_norm(&grad, row_major)?;
    let r_norm = unitwise_norm(reference, row_major)?.to_dtype(grad.dtype())?;
    if g_norm.dims() != r_norm.dims() {
        return Err(Error::shape(format!(
            "cannot clip units of {:?} against a reference with unit norms {:?}",
            grad.dims(),
            r_norm.dims()
        )));
    }

    let max_norm = floor_at(&r_norm, eps)?.affine(clip, 0.0)?;
    let scale = max_norm.div(&floor_at(&g_norm, GRAD_NORM_FLOOR)?)?;
    let scale = cap_at(&scale, 1.0)?;
    Ok(grad.broadcast_mul(&scale)?)
}

/// Applies the configured rescale strategy and writes gradients back
#[derive(Debug, Clone)]
pub struct Rescaler {
    strategy: GradientRescale,
    kl_clip: f64,
    unit_clip: f64,
    unit_clip_eps: f64,
    clip_bias: bool,
}

impl Rescaler {
    /// Build from configuration
    pub fn from_config(config: &KfacConfig) -> Self {
        Self {
            strategy: config.gradient_rescale,
            kl_clip: config.kl_clip,
            unit_clip: config.unit_clip,
            unit_clip_eps: config.unit_clip_eps,
            clip_bias: config.clip_bias,
        }
    }

    /// Active strategy
    pub fn strategy(&self) -> GradientRescale {
        self.strategy
    }

    /// Rescale `updates` and write them into `grads`.
    ///
    /// `layers`, `states` and `updates` are parallel slices in registry order.
    pub fn apply(
        &self,
        layers: &[LayerHandle],
        states: &[LayerState],
        updates: &[LayerUpdate],
        lr: f64,
        grads: &mut GradStore,
        stats: &mut StepStats,
    ) -> Result<()> {
        if layers.len() != updates.len() || layers.len() != states.len() {
            return Err(Error::internal(format!(
                "rescaler got {} layers, {} states and {} updates",
                layers.len(),
                states.len(),
                updates.len()
            )));
        }

        stats.pre_norm = global_norm(updates.iter().flat_map(|u| {
            std::iter::once(&u.raw_weight).chain(u.raw_bias.as_ref())
        }))?;

        match self.strategy {
            GradientRescale::GlobalKl => {
                self.apply_global_kl(layers, updates, lr, grads, stats)?
            }
            GradientRescale::Adaptive => {
                self.apply_adaptive(layers, states, updates, grads, stats)?
            }
            GradientRescale::KroneckerNorm => {
                self.apply_kronecker_norm(layers, states, updates, grads, stats)?
            }
        }

        let mut written = Vec::new();
        for layer in layers {
            if let Some(g) = grads.get(layer.weight().as_tensor()) {
                written.push(g.clone());
            }
            if let Some(bias) = layer.bias() {
                if let Some(g) = grads.get(bias.as_tensor()) {
                    written.push(g.clone());
                }
            }
        }
        stats.post_norm = global_norm(written.iter())?;

        debug!(
            "Rescaled gradients ({:?}): nu={:.4e} |g| {:.4e} -> {:.4e}",
            self.strategy, stats.nu, stats.pre_norm, stats.post_norm
        );
        Ok(())
    }

    fn apply_global_kl(
        &self,
        layers: &[LayerHandle],
        updates: &[LayerUpdate],
        lr: f64,
        grads: &mut GradStore,
        stats: &mut StepStats,
    ) -> Result<()> {
        let lr2 = lr * lr;
        let mut vg_sum = 0.0;
        for update in updates {
            let corrected = &update.corrected;
            let raw = update.raw_weight.to_dtype(corrected.weight.dtype())?;
            vg_sum += sum_f64(&corrected.weight.mul(&raw)?)? * lr2;
            if let (Some(v), Some(raw)) = (&corrected.bias, &update.raw_bias) {
                vg_sum += sum_f64(&v.mul(&raw.to_dtype(v.dtype())?)?)? * lr2;
            }
        }

        if !vg_sum.is_finite() {
            warn!("KL-clip sum is {}; corrected gradients diverged", vg_sum);
            return Err(Error::internal(format!(
                "non-finite KL-clip sum {} from the preconditioned gradients",
                vg_sum
            )));
        }
        let nu = kl_clip_scale(vg_sum, self.kl_clip);
        stats.nu = nu;

        for (layer, update) in layers.iter().zip(updates) {
            let weight = update.corrected.weight.affine(nu, 0.0)?;
            write_grad(grads, layer.weight().as_tensor(), &weight)?;
            if let (Some(bias), Some(v)) = (layer.bias(), &update.corrected.bias) {
                write_grad(grads, bias.as_tensor(), &v.affine(nu, 0.0)?)?;
            }
        }
        Ok(())
    }

    fn apply_adaptive(
        &self,
        layers: &[LayerHandle],
        states: &[LayerState],
        updates: &[LayerUpdate],
        grads: &mut GradStore,
        stats: &mut StepStats,
    ) -> Result<()> {
        stats.nu = self.unit_clip;

        for ((layer, state), update) in layers.iter().zip(states).zip(updates) {
            let qa = state.require(FactorSide::A, layer.name())?.eigenvectors();
            let qg = state.require(FactorSide::G, layer.name())?.eigenvectors();
            stats.eigvec_a_norm += frobenius_norm(qa)?;
            stats.eigvec_g_norm += frobenius_norm(qg)?;

            let grad = as_matrix(&update.corrected.weight)?;
            let weight = as_matrix(layer.weight().as_tensor())?;
            let (rows, cols) = grad.dims2()?;
            let row_major = rows > cols;

            stats.weight_unit_norm += frobenius_norm(&unitwise_norm(&weight, row_major)?)?;
            stats.grad_unit_norm += frobenius_norm(&unitwise_norm(&grad, row_major)?)?;

            let clipped =
                clip_units(&grad, &weight, row_major, self.unit_clip_eps, self.unit_clip)?;
            write_grad(grads, layer.weight().as_tensor(), &clipped)?;
            self.write_bias(layer, update, grads)?;
        }
        Ok(())
    }

    fn apply_kronecker_norm(
        &self,
        layers: &[LayerHandle],
        states: &[LayerState],
        updates: &[LayerUpdate],
        grads: &mut GradStore,
        stats: &mut StepStats,
    ) -> Result<()> {
        stats.nu = self.unit_clip;

        for ((layer, state), update) in layers.iter().zip(states).zip(updates) {
            let qa = state.require(FactorSide::A, layer.name())?.eigenvectors();
            let qg = state.require(FactorSide::G, layer.name())?.eigenvectors();
            stats.eigvec_a_norm += frobenius_norm(qa)?;
            stats.eigvec_g_norm += frobenius_norm(qg)?;

            let grad = as_matrix(&update.corrected.weight)?;
            let (_, cols) = grad.dims2()?;
            let qa = if layer.has_bias() {
                qa.narrow(0, 0, cols)?.narrow(1, 0, cols)?
            } else {
                qa.clone()
            };

            let grad = clip_units(&grad, qg, true, self.unit_clip_eps, self.unit_clip)?;
            let grad = clip_units(&grad, &qa, false, self.unit_clip_eps, self.unit_clip)?;
            write_grad(grads, layer.weight().as_tensor(), &grad)?;
            self.write_bias(layer, update, grads)?;
        }
        Ok(())
    }

    /// Per-element clip of the corrected bias against the bias values.
    ///
    /// Without `clip_bias` the raw bias gradient is left in place.
    fn write_bias(
        &self,
        layer: &LayerHandle,
        update: &LayerUpdate,
        grads: &mut GradStore,
    ) -> Result<()> {
        if !self.clip_bias {
            return Ok(());
        }
        if let (Some(bias), Some(v)) = (layer.bias(), &update.corrected.bias) {
            let clipped =
                clip_units(v, bias.as_tensor(), true, self.unit_clip_eps, self.unit_clip)?;
            write_grad(grads, bias.as_tensor(), &clipped)?;
        }
        Ok(())
    }
}

/// Store `value`, reshaped and cast like `param`, as the gradient of `param`
fn write_grad(grads: &mut GradStore, param: &Tensor, value: &Tensor) -> Result<()> {
    let value = value.reshape(param.shape().clone())?.to_dtype(param.dtype())?;
    grads.insert(param, value);
    Ok(())
}

fn global_norm<'a>(tensors: impl Iterator<Item = &'a Tensor>) -> Result<f64> {
    let mut total = 0.0;
    for t in tensors {
        let n = frobenius_norm(t)?;
        total += n * n;
    }
    Ok(total.sqrt())
}
