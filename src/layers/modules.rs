//! Capture-aware layer implementations
//!
//! Drop-in layers whose forward pass feeds the attached [`CaptureHook`]. The
//! parameters are candle `Var`s so a `VarMap`-free model can hand them straight
//! to the base optimizer.

use candle_core::{Device, Module, Tensor, Var, D};

use super::{CaptureHook, Conv2dGeometry, LayerKind, TrainableLayer};

fn uniform_var(shape: &[usize], fan_in: usize, device: &Device) -> candle_core::Result<Var> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    let init = Tensor::rand(-bound, bound, shape, device)?;
    Var::from_tensor(&init)
}

/// Dense layer `y = x Wᵀ + b`
#[derive(Debug, Clone)]
pub struct Linear {
    name: String,
    weight: Var,
    bias: Option<Var>,
    hook: Option<CaptureHook>,
}

impl Linear {
    /// Wrap existing parameters
    pub fn new(name: impl Into<String>, weight: Var, bias: Option<Var>) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
            hook: None,
        }
    }

    /// Uniformly initialized layer mapping `in_features` to `out_features`
    pub fn init(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        bias: bool,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let weight = uniform_var(&[out_features, in_features], in_features, device)?;
        let bias = if bias {
            Some(uniform_var(&[out_features], in_features, device)?)
        } else {
            None
        };
        Ok(Self::new(name, weight, bias))
    }

    /// Attached capture hook
    pub fn hook(&self) -> Option<&CaptureHook> {
        self.hook.as_ref()
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if let Some(hook) = &self.hook {
            hook.save_input(xs);
        }
        let inner = candle_nn::Linear::new(
            self.weight.as_tensor().clone(),
            self.bias.as_ref().map(|b| b.as_tensor().clone()),
        );
        let ys = inner.forward(xs)?;
        match &self.hook {
            Some(hook) => hook.track_output(ys),
            None => Ok(ys),
        }
    }
}

impl TrainableLayer for Linear {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Linear
    }

    fn weight(&self) -> &Var {
        &self.weight
    }

    fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    fn attach_hook(&mut self, hook: CaptureHook) {
        self.hook = Some(hook);
    }
}

/// 2-D convolution over `(batch, channels, height, width)` inputs
#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    geometry: Conv2dGeometry,
    weight: Var,
    bias: Option<Var>,
    hook: Option<CaptureHook>,
}

impl Conv2d {
    /// Wrap existing parameters; the kernel size is read from the weight
    pub fn new(
        name: impl Into<String>,
        weight: Var,
        bias: Option<Var>,
        stride: usize,
        padding: usize,
    ) -> Self {
        let dims = weight.dims();
        let kernel = match dims {
            [_, _, kh, kw] => (*kh, *kw),
            _ => (0, 0),
        };
        Self {
            name: name.into(),
            geometry: Conv2dGeometry {
                kernel,
                stride,
                padding,
            },
            weight,
            bias,
            hook: None,
        }
    }

    /// Uniformly initialized convolution
    pub fn init(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        geometry: Conv2dGeometry,
        bias: bool,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let (kh, kw) = geometry.kernel;
        let fan_in = in_channels * kh * kw;
        let weight = uniform_var(&[out_channels, in_channels, kh, kw], fan_in, device)?;
        let bias = if bias {
            Some(uniform_var(&[out_channels], fan_in, device)?)
        } else {
            None
        };
        Ok(Self {
            name: name.into(),
            geometry,
            weight,
            bias,
            hook: None,
        })
    }

    /// Kernel, stride and padding
    pub fn geometry(&self) -> Conv2dGeometry {
        self.geometry
    }

    /// Attached capture hook
    pub fn hook(&self) -> Option<&CaptureHook> {
        self.hook.as_ref()
    }
}

impl Module for Conv2d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if let Some(hook) = &self.hook {
            hook.save_input(xs);
        }
        let mut ys = xs.conv2d(
            self.weight.as_tensor(),
            self.geometry.padding,
            self.geometry.stride,
            1,
            1,
        )?;
        if let Some(bias) = &self.bias {
            let filters = bias.dims()[0];
            ys = ys.broadcast_add(&bias.as_tensor().reshape((1, filters, 1, 1))?)?;
        }
        match &self.hook {
            Some(hook) => hook.track_output(ys),
            None => Ok(ys),
        }
    }
}

impl TrainableLayer for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Conv2d(self.geometry)
    }

    fn weight(&self) -> &Var {
        &self.weight
    }

    fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    fn attach_hook(&mut self, hook: CaptureHook) {
        self.hook = Some(hook);
    }
}

/// Layer normalization over the last dimension with an element-wise affine map.
///
/// The captured input is the normalized activation that the affine map is
/// applied to.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    name: String,
    weight: Var,
    bias: Option<Var>,
    eps: f64,
    hook: Option<CaptureHook>,
}

impl LayerNorm {
    /// Wrap existing parameters
    pub fn new(name: impl Into<String>, weight: Var, bias: Option<Var>, eps: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            bias,
            eps,
            hook: None,
        }
    }

    /// Unit scale, zero shift
    pub fn init(
        name: impl Into<String>,
        features: usize,
        bias: bool,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let weight = Var::ones(features, candle_core::DType::F32, device)?;
        let bias = if bias {
            Some(Var::zeros(features, candle_core::DType::F32, device)?)
        } else {
            None
        };
        Ok(Self::new(name, weight, bias, 1e-5))
    }

    /// Attached capture hook
    pub fn hook(&self) -> Option<&CaptureHook> {
        self.hook.as_ref()
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&var.affine(1.0, self.eps)?.sqrt()?)?;

        if let Some(hook) = &self.hook {
            hook.save_input(&normalized);
        }
        let mut ys = normalized.broadcast_mul(self.weight.as_tensor())?;
        if let Some(bias) = &self.bias {
            ys = ys.broadcast_add(bias.as_tensor())?;
        }
        match &self.hook {
            Some(hook) => hook.track_output(ys),
            None => Ok(ys),
        }
    }
}

impl TrainableLayer for LayerNorm {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Normalization
    }

    fn weight(&self) -> &Var {
        &self.weight
    }

    fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    fn attach_hook(&mut self, hook: CaptureHook) {
        self.hook = Some(hook);
    }
}
