//! Deterministic toy models shared by the scenario tests

use anyhow::Result;
use candle_core::{Device, Module, Tensor, Var};

use crate::layers::{Conv2d, Conv2dGeometry, KfacModel, LayerNorm, Linear, TrainableLayer};

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> Device {
    Device::Cpu
}

/// Tensor of `sin(k * i)` over the flat index `i`
pub fn wave(shape: &[usize], k: f64, device: &Device) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    Ok(Tensor::arange(0f32, n as f32, device)?
        .affine(k, 0.3)?
        .sin()?
        .reshape(shape)?)
}

fn wave_var(shape: &[usize], k: f64, device: &Device) -> Result<Var> {
    Ok(Var::from_tensor(&wave(shape, k, device)?.affine(0.5, 0.0)?)?)
}

/// Dense 3 -> 4 (bias) -> relu -> dense 4 -> 2
pub struct TwoLayer {
    pub fc1: Linear,
    pub fc2: Linear,
}

impl TwoLayer {
    pub fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            fc1: Linear::new(
                "fc1",
                wave_var(&[4, 3], 0.7, device)?,
                Some(wave_var(&[4], 1.3, device)?),
            ),
            fc2: Linear::new("fc2", wave_var(&[2, 4], 0.4, device)?, None),
        })
    }
}

impl Module for TwoLayer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(xs)?.relu()?;
        self.fc2.forward(&h)
    }
}

impl KfacModel for TwoLayer {
    fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
        vec![&mut self.fc1, &mut self.fc2]
    }
}

/// Conv 2 -> 4 (k3, pad 1, bias) on 5x5 inputs -> layer norm -> dense 100 -> 3
pub struct ConvNet {
    pub conv: Conv2d,
    pub norm: LayerNorm,
    pub fc: Linear,
}

impl ConvNet {
    pub const CHANNELS: usize = 2;
    pub const SIDE: usize = 5;

    pub fn new(device: &Device) -> Result<Self> {
        let conv = Conv2d::new(
            "conv",
            wave_var(&[4, Self::CHANNELS, 3, 3], 0.9, device)?,
            Some(wave_var(&[4], 0.2, device)?),
            1,
            1,
        );
        let features = 4 * Self::SIDE * Self::SIDE;
        let norm = LayerNorm::new(
            "norm",
            Var::from_tensor(&wave(&[features], 0.05, device)?.affine(0.1, 1.0)?)?,
            Some(wave_var(&[features], 0.11, device)?),
            1e-5,
        );
        let fc = Linear::new(
            "fc",
            wave_var(&[3, features], 0.37, device)?,
            Some(wave_var(&[3], 2.1, device)?),
        );
        Ok(Self { conv, norm, fc })
    }

    pub fn input(batch: usize, device: &Device) -> Result<Tensor> {
        wave(&[batch, Self::CHANNELS, Self::SIDE, Self::SIDE], 0.61, device)
    }

    pub fn geometry(&self) -> Conv2dGeometry {
        self.conv.geometry()
    }
}

impl Module for ConvNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv.forward(xs)?.relu()?.flatten_from(1)?;
        let h = self.norm.forward(&h)?;
        self.fc.forward(&h)
    }
}

impl KfacModel for ConvNet {
    fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
        vec![&mut self.conv, &mut self.norm, &mut self.fc]
    }
}

/// Squared error against a constant target, so every row contributes independently
pub fn regression_loss(pred: &Tensor) -> Result<Tensor> {
    Ok(pred.affine(1.0, -0.5)?.sqr()?.mean_all()?)
}

/// Assert two tensors agree element-wise within `tol`
pub fn assert_tensor_close(a: &Tensor, b: &Tensor, tol: f32) -> Result<()> {
    assert_eq!(a.dims(), b.dims(), "shape mismatch");
    let diff = a
        .sub(b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff <= tol, "tensors differ by {} (tolerance {})", diff, tol);
    Ok(())
}

/// Sum of absolute values
pub fn abs_sum(t: &Tensor) -> Result<f32> {
    Ok(t.abs()?.sum_all()?.to_scalar::<f32>()?)
}
