//! Running-average factor store

use candle_core::Tensor;

use super::FactorSide;
use crate::error::{Error, Result};

/// `decay · current + (1 − decay) · new`
pub fn update_running_avg(new: &Tensor, current: &Tensor, decay: f64) -> Result<Tensor> {
    if new.dims() != current.dims() {
        return Err(Error::shape(format!(
            "running average of shape {:?} cannot absorb an estimate of shape {:?}",
            current.dims(),
            new.dims()
        )));
    }
    Ok((current.affine(decay, 0.0)? + new.affine(1.0 - decay, 0.0)?)?)
}

/// One Kronecker factor together with its eigenbuffers
#[derive(Debug, Clone)]
pub struct FactorState {
    pub(crate) factor: Tensor,
    pub(crate) eigenvectors: Tensor,
    pub(crate) eigenvalues: Tensor,
}

impl FactorState {
    /// Identity factor with zeroed eigenbuffers, sized after `estimate`
    pub fn init(estimate: &Tensor) -> Result<Self> {
        let (rows, cols) = estimate.dims2()?;
        if rows != cols {
            return Err(Error::shape(format!(
                "factor estimates must be square, got {}x{}",
                rows, cols
            )));
        }
        let (dtype, device) = (estimate.dtype(), estimate.device());
        Ok(Self {
            factor: Tensor::eye(rows, dtype, device)?,
            eigenvectors: Tensor::zeros((rows, rows), dtype, device)?,
            eigenvalues: Tensor::zeros(rows, dtype, device)?,
        })
    }

    /// Blend an estimate into the running average
    pub fn update(&mut self, estimate: &Tensor, decay: f64) -> Result<()> {
        self.factor = update_running_avg(estimate, &self.factor, decay)?;
        Ok(())
    }

    /// Zero both eigenbuffers
    pub fn clear_eigen(&mut self) -> Result<()> {
        self.eigenvectors = self.eigenvectors.zeros_like()?;
        self.eigenvalues = self.eigenvalues.zeros_like()?;
        Ok(())
    }

    /// Current running-average factor
    pub fn factor(&self) -> &Tensor {
        &self.factor
    }

    /// Eigenvectors, column `j` pairs with eigenvalue `j`
    pub fn eigenvectors(&self) -> &Tensor {
        &self.eigenvectors
    }

    /// Thresholded eigenvalues
    pub fn eigenvalues(&self) -> &Tensor {
        &self.eigenvalues
    }

    /// Factor dimension
    pub fn dim(&self) -> usize {
        self.eigenvalues.dims().first().copied().unwrap_or(0)
    }
}

/// Per-layer arena entry
#[derive(Debug, Clone, Default)]
pub struct LayerState {
    /// Activation factor, allocated on the first factor update
    pub a: Option<FactorState>,
    /// Output-gradient factor, allocated on the first factor update
    pub g: Option<FactorState>,
}

impl LayerState {
    /// Factor state of one side, if allocated
    pub fn side(&self, side: FactorSide) -> Option<&FactorState> {
        match side {
            FactorSide::A => self.a.as_ref(),
            FactorSide::G => self.g.as_ref(),
        }
    }

    /// Mutable factor state of one side, if allocated
    pub fn side_mut(&mut self, side: FactorSide) -> Option<&mut FactorState> {
        match side {
            FactorSide::A => self.a.as_mut(),
            FactorSide::G => self.g.as_mut(),
        }
    }

    pub(crate) fn require(&self, side: FactorSide, layer: &str) -> Result<&FactorState> {
        self.side(side).ok_or_else(|| {
            Error::internal(format!(
                "layer '{}' has no {} factor yet; the first step must be a factor update",
                layer, side
            ))
        })
    }

    /// Blend an estimate into one side, allocating it as identity first
    pub fn blend(&mut self, side: FactorSide, estimate: &Tensor, decay: f64) -> Result<()> {
        let slot = match side {
            FactorSide::A => &mut self.a,
            FactorSide::G => &mut self.g,
        };
        if slot.is_none() {
            *slot = Some(FactorState::init(estimate)?);
        }
        match slot {
            Some(state) => state.update(estimate, decay),
            None => Err(Error::internal("factor state vanished after allocation")),
        }
    }
}
