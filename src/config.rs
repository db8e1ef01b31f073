//! Configuration structures for the KFAC preconditioner

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::layers::LayerKindTag;

/// Main configuration for the KFAC preconditioner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KfacConfig {
    /// Learning rate, used by the KL-clip rescaling
    pub lr: f64,
    /// Running average coefficient for the Kronecker factors
    pub factor_decay: f64,
    /// Tikhonov damping added to the eigenvalue products
    pub damping: f64,
    /// Bound on the quadratic-model change in loss for KL-clip rescaling
    pub kl_clip: f64,
    /// Iterations between factor estimation rounds
    pub fac_update_freq: usize,
    /// Iterations between eigendecomposition rounds
    pub kfac_update_freq: usize,
    /// Whether the loss gradient is already averaged over the batch
    pub batch_averaged: bool,
    /// Number of diagonal blocks for Conv2d eigendecompositions
    pub diag_blocks: usize,
    /// Epoch at which the block-diagonal approximation starts
    pub diag_warmup: usize,
    /// Compute the A and G eigendecompositions of a layer on different workers.
    /// `None` picks `true` when there are more workers than layers.
    pub distribute_layer_factors: Option<bool>,
    /// Strategy used to bound the corrected gradient
    pub gradient_rescale: GradientRescale,
    /// Per-unit clip ratio for the adaptive and Kronecker-norm strategies
    pub unit_clip: f64,
    /// Floor on the reference unit norm for the adaptive and Kronecker-norm strategies
    pub unit_clip_eps: f64,
    /// Also rescale and write the corrected bias under the per-unit strategies
    pub clip_bias: bool,
    /// Eigenvalues at or below this threshold are zeroed
    pub eigen_eps: f64,
    /// Layer kinds that get registered
    pub layer_kinds: Vec<LayerKindTag>,
    /// Communication backend
    pub comm: CommBackend,
    /// Epoch schedule for damping and update frequencies
    pub schedule: Option<ScheduleConfig>,
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            factor_decay: 0.95,
            damping: 0.001,
            kl_clip: 0.001,
            fac_update_freq: 10,
            kfac_update_freq: 100,
            batch_averaged: true,
            diag_blocks: 1,
            diag_warmup: 0,
            distribute_layer_factors: None,
            gradient_rescale: GradientRescale::Adaptive,
            unit_clip: 0.02,
            unit_clip_eps: 1e-3,
            clip_bias: false,
            eigen_eps: 1e-10,
            layer_kinds: vec![
                LayerKindTag::Linear,
                LayerKindTag::Conv2d,
                LayerKindTag::Normalization,
            ],
            comm: CommBackend::Local,
            schedule: None,
        }
    }
}

impl KfacConfig {
    /// Load configuration from a JSON or YAML file (chosen by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0) {
            return Err(Error::config(format!("Invalid learning rate: {}", self.lr)));
        }

        if !(0.0..=1.0).contains(&self.factor_decay) {
            return Err(Error::config(format!(
                "Invalid factor decay rate: {}",
                self.factor_decay
            )));
        }

        if !(self.damping > 0.0) {
            return Err(Error::config(format!("Invalid damping: {}", self.damping)));
        }

        if !(self.kl_clip > 0.0) {
            return Err(Error::config(format!("Invalid clipping value: {}", self.kl_clip)));
        }

        if self.fac_update_freq == 0 {
            return Err(Error::config("Invalid factor update frequency: 0"));
        }

        if self.kfac_update_freq == 0 {
            return Err(Error::config("Invalid K-FAC update frequency: 0"));
        }

        if self.diag_blocks == 0 {
            return Err(Error::config("Invalid diagonal block approx count: 0"));
        }

        if !(self.unit_clip > 0.0) || !(self.unit_clip_eps > 0.0) {
            return Err(Error::config("Unit clip ratio and eps must be positive"));
        }

        if !(self.eigen_eps >= 0.0) {
            return Err(Error::config("Eigenvalue threshold must be non-negative"));
        }

        if self.layer_kinds.is_empty() {
            return Err(Error::config("At least one layer kind must be registered"));
        }

        if let CommBackend::Threads { workers: 0 } = self.comm {
            return Err(Error::config("Thread communicator needs at least one worker"));
        }

        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }

        Ok(())
    }

    /// Non-fatal advisories about this configuration
    pub fn advisories(&self) -> Vec<String> {
        let mut notes = Vec::new();
        if self.fac_update_freq > 0 && self.kfac_update_freq % self.fac_update_freq != 0 {
            notes.push(
                "it is suggested that kfac_update_freq be a multiple of fac_update_freq".to_string(),
            );
        }
        if self.diag_blocks > 1 {
            notes.push("diag_blocks > 1 is experimental and may give poor results".to_string());
        }
        notes
    }
}

/// Gradient rescaling strategies applied after preconditioning
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GradientRescale {
    /// Per-unit adaptive clip against the weight norms
    #[default]
    Adaptive,
    /// Global KL-norm clip across all layers
    GlobalKl,
    /// Row/column clip against the Kronecker eigenvector norms
    KroneckerNorm,
}

/// Communication backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase", tag = "backend")]
pub enum CommBackend {
    /// Single worker, reductions are identities
    #[default]
    Local,
    /// In-process collective across worker threads
    Threads {
        /// Number of worker threads
        workers: usize,
    },
}

impl CommBackend {
    /// Number of workers this backend runs with
    pub fn world_size(&self) -> usize {
        match self {
            CommBackend::Local => 1,
            CommBackend::Threads { workers } => *workers,
        }
    }
}

/// Epoch schedule for damping and update frequencies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Multiplicative factor applied to the damping at each damping milestone
    pub damping_alpha: f64,
    /// Epochs at which the damping is multiplied by `damping_alpha`
    pub damping_schedule: Vec<usize>,
    /// Multiplicative factor applied to both update frequencies at each milestone
    pub update_freq_alpha: f64,
    /// Epochs at which the update frequencies are multiplied by `update_freq_alpha`
    pub update_freq_schedule: Vec<usize>,
    /// Starting epoch, when resuming training
    pub start_epoch: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            damping_alpha: 1.0,
            damping_schedule: Vec::new(),
            update_freq_alpha: 1.0,
            update_freq_schedule: Vec::new(),
            start_epoch: 0,
        }
    }
}

impl ScheduleConfig {
    /// Validate schedule values
    pub fn validate(&self) -> Result<()> {
        if !(self.damping_alpha > 0.0) || !(self.update_freq_alpha > 0.0) {
            return Err(Error::config("Schedule alphas must be positive"));
        }
        Ok(())
    }
}
