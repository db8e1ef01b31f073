//! Layer registry and capture hooks
//!
//! Models expose their trainable layers through [`KfacModel`]. The
//! [`LayerRegistry`] walks them in discovery order, keeps the ones whose kind is
//! supported, assigns each a stable [`LayerId`] and attaches a [`CaptureHook`].
//! The id is the index into every per-layer arena the preconditioner keeps, and
//! the registry order is the iteration order used everywhere else.

pub mod hooks;
pub mod modules;

pub use hooks::{CaptureHook, CapturedSample, HookManager, NoGradGuard};
pub use modules::{Conv2d, LayerNorm, Linear};

use candle_core::Var;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Stable integer id assigned at registration time
pub type LayerId = usize;

/// Convolution geometry needed to unfold inputs into patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dGeometry {
    /// Kernel size (height, width)
    pub kernel: (usize, usize),
    /// Stride, applied to both spatial dims
    pub stride: usize,
    /// Zero padding, applied to both spatial dims
    pub padding: usize,
}

/// Kind of a trainable layer, with the data each kind needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Dense layer with weight `(out, in)`
    Linear,
    /// 2-D convolution with weight `(filters, channels, kh, kw)`
    Conv2d(Conv2dGeometry),
    /// Element-wise affine normalization with weight `(features,)`
    Normalization,
}

impl LayerKind {
    /// Field-less tag of this kind
    pub fn tag(&self) -> LayerKindTag {
        match self {
            LayerKind::Linear => LayerKindTag::Linear,
            LayerKind::Conv2d(_) => LayerKindTag::Conv2d,
            LayerKind::Normalization => LayerKindTag::Normalization,
        }
    }

    /// Number of diagonal blocks this kind uses when `requested` are configured.
    ///
    /// Only convolutions support the block-diagonal approximation.
    pub fn diag_blocks(&self, requested: usize) -> usize {
        match self {
            LayerKind::Conv2d(_) => requested,
            LayerKind::Linear | LayerKind::Normalization => 1,
        }
    }
}

/// Discriminant of [`LayerKind`], used for the configured set of supported kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKindTag {
    /// Dense layers
    Linear,
    /// 2-D convolutions
    Conv2d,
    /// Normalization layers
    Normalization,
}

/// A layer that exposes its parameters and accepts a capture hook
pub trait TrainableLayer {
    /// Display name
    fn name(&self) -> &str;

    /// Layer kind
    fn kind(&self) -> LayerKind;

    /// Weight parameter
    fn weight(&self) -> &Var;

    /// Optional bias parameter
    fn bias(&self) -> Option<&Var>;

    /// Attach the capture hook handed out at registration
    fn attach_hook(&mut self, hook: CaptureHook);
}

/// A model whose layers can be preconditioned
pub trait KfacModel {
    /// Trainable layers in discovery order
    fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer>;
}

/// Registry view of one layer.
///
/// The parameters are `Var` clones, so they share storage with the model
/// rather than owning a copy of it.
#[derive(Debug, Clone)]
pub struct LayerHandle {
    id: LayerId,
    name: String,
    kind: LayerKind,
    weight: Var,
    bias: Option<Var>,
}

impl LayerHandle {
    /// Registration id
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layer kind
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Weight parameter
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Bias parameter, if any
    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Whether the layer has a bias
    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Dimension of the A factor (input features, +1 with a bias)
    pub fn a_dim(&self) -> usize {
        let dims = self.weight.dims();
        let inputs = match self.kind {
            LayerKind::Linear | LayerKind::Conv2d(_) => {
                dims.iter().skip(1).product::<usize>()
            }
            LayerKind::Normalization => 1,
        };
        inputs + usize::from(self.has_bias())
    }

    /// Dimension of the G factor (output features)
    pub fn g_dim(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }
}

/// Ordered list of registered layers
#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: Vec<LayerHandle>,
}

impl LayerRegistry {
    /// Walk `model`, register every supported layer and attach its hooks
    pub fn build<M: KfacModel + ?Sized>(
        model: &mut M,
        supported: &[LayerKindTag],
        hooks: &HookManager,
    ) -> Result<Self> {
        let mut layers = Vec::new();

        for layer in model.layers_mut() {
            let kind = layer.kind();
            if !supported.contains(&kind.tag()) {
                debug!("Skipping layer '{}' of unsupported kind {:?}", layer.name(), kind);
                continue;
            }

            Self::check_shapes(&*layer)?;

            let hook = hooks.attach();
            let handle = LayerHandle {
                id: hook.layer_id(),
                name: layer.name().to_string(),
                kind,
                weight: layer.weight().clone(),
                bias: layer.bias().cloned(),
            };
            debug!(
                "Registered layer '{}' as #{} ({:?}, A {}x{}, G {}x{})",
                handle.name,
                handle.id,
                kind,
                handle.a_dim(),
                handle.a_dim(),
                handle.g_dim(),
                handle.g_dim()
            );
            layer.attach_hook(hook);
            layers.push(handle);
        }

        Ok(Self { layers })
    }

    fn check_shapes(layer: &dyn TrainableLayer) -> Result<()> {
        let weight = layer.weight().dims();
        let expected_rank = match layer.kind() {
            LayerKind::Linear => 2,
            LayerKind::Conv2d(_) => 4,
            LayerKind::Normalization => 1,
        };
        if weight.len() != expected_rank {
            return Err(Error::shape(format!(
                "layer '{}' of kind {:?} has weight shape {:?}",
                layer.name(),
                layer.kind(),
                weight
            )));
        }
        if let Some(bias) = layer.bias() {
            if bias.dims() != [weight[0]].as_slice() {
                return Err(Error::shape(format!(
                    "layer '{}' has bias shape {:?} for {} outputs",
                    layer.name(),
                    bias.dims(),
                    weight[0]
                )));
            }
        }
        Ok(())
    }

    /// Registered layers in registry order
    pub fn layers(&self) -> &[LayerHandle] {
        &self.layers
    }

    /// Layer by id
    pub fn get(&self, id: LayerId) -> Option<&LayerHandle> {
        self.layers.get(id)
    }

    /// Number of registered layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether nothing was registered
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
