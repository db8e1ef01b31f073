//! Per-layer factor estimators
//!
//! Estimates are computed in the dtype of the captured tensors and are always
//! square: `A` has the input dimension (+1 with a bias), `G` the output
//! dimension.

use candle_core::{Tensor, D};

use crate::error::{Error, Result};
use crate::layers::{Conv2dGeometry, LayerHandle, LayerKind};

/// Activation factor estimate `A` for one layer
pub fn compute_a(a: &Tensor, layer: &LayerHandle) -> Result<Tensor> {
    let batch = leading_dim(a, layer)?;
    let a = match layer.kind() {
        LayerKind::Linear => {
            let a = flatten_middle_mean(a)?;
            if layer.has_bias() {
                append_ones(&a)?
            } else {
                a
            }
        }
        LayerKind::Conv2d(geometry) => {
            let (patches, spatial) = extract_patches(a, geometry)?;
            let patches = if layer.has_bias() {
                append_ones(&patches)?
            } else {
                patches
            };
            patches.affine(1.0 / spatial as f64, 0.0)?
        }
        LayerKind::Normalization => {
            let rms = a.sqr()?.mean_keepdim(D::Minus1)?.sqrt()?;
            let rms = flatten_middle_mean(&rms)?;
            if layer.has_bias() {
                append_ones(&rms)?
            } else {
                rms
            }
        }
    };
    check_dim(&a, layer.a_dim(), layer)?;
    second_moment(&a, 1.0 / batch as f64)
}

/// Output-gradient factor estimate `G` for one layer
pub fn compute_g(g: &Tensor, layer: &LayerHandle, batch_averaged: bool) -> Result<Tensor> {
    let batch = leading_dim(g, layer)?;
    let g = match layer.kind() {
        LayerKind::Linear | LayerKind::Normalization => {
            let g = flatten_middle_mean(g)?;
            check_dim(&g, layer.g_dim(), layer)?;
            let scale = if batch_averaged {
                batch as f64
            } else {
                1.0 / batch as f64
            };
            return second_moment(&g, scale);
        }
        LayerKind::Conv2d(_) => {
            let (b, filters, oh, ow) = g.dims4()?;
            let spatial = oh * ow;
            let g = g
                .permute((0, 2, 3, 1))?
                .reshape((b * spatial, filters))?;
            let scale = if batch_averaged {
                (batch * spatial) as f64
            } else {
                spatial as f64
            };
            g.affine(scale, 0.0)?
        }
    };
    check_dim(&g, layer.g_dim(), layer)?;
    let rows = g.dims()[0];
    second_moment(&g, 1.0 / rows as f64)
}

/// Unfold a `(batch, channels, height, width)` input into patches.
///
/// Returns `(batch·oh·ow, channels·kh·kw)` patches in the weight's flattening
/// order, and the number of spatial locations `oh·ow`. The unfold is a
/// convolution with an identity kernel, one output channel per patch element.
pub fn extract_patches(x: &Tensor, geometry: Conv2dGeometry) -> Result<(Tensor, usize)> {
    let (_, channels, _, _) = x.dims4()?;
    let (kh, kw) = geometry.kernel;
    let k = channels * kh * kw;

    let kernel = Tensor::eye(k, x.dtype(), x.device())?.reshape((k, channels, kh, kw))?;
    let unfolded = x.conv2d(&kernel, geometry.padding, geometry.stride, 1, 1)?;
    let (b, _, oh, ow) = unfolded.dims4()?;
    let patches = unfolded.permute((0, 2, 3, 1))?.reshape((b * oh * ow, k))?;
    Ok((patches, oh * ow))
}

fn leading_dim(x: &Tensor, layer: &LayerHandle) -> Result<usize> {
    match x.dims() {
        [batch, _, ..] if *batch > 0 => Ok(*batch),
        dims => Err(Error::shape(format!(
            "layer '{}' captured a tensor of shape {:?}, expected (batch, ..., features)",
            layer.name(),
            dims
        ))),
    }
}

fn check_dim(x: &Tensor, expected: usize, layer: &LayerHandle) -> Result<()> {
    let cols = x.dims().last().copied().unwrap_or(0);
    if cols != expected {
        return Err(Error::shape(format!(
            "layer '{}' expected {} factor columns, got {}",
            layer.name(),
            expected,
            cols
        )));
    }
    Ok(())
}

/// Average over every dimension between the first and the last
fn flatten_middle_mean(x: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    if dims.len() <= 2 {
        return Ok(x.clone());
    }
    let batch = dims[0];
    let features = dims[dims.len() - 1];
    let middle = x.elem_count() / (batch * features).max(1);
    Ok(x.reshape((batch, middle, features))?.mean(1)?)
}

fn append_ones(x: &Tensor) -> Result<Tensor> {
    let rows = x.dims()[0];
    let ones = Tensor::ones((rows, 1), x.dtype(), x.device())?;
    Ok(Tensor::cat(&[x, &ones], 1)?)
}

/// `xᵀ · (x · scale)`
fn second_moment(x: &Tensor, scale: f64) -> Result<Tensor> {
    let scaled = x.affine(scale, 0.0)?;
    Ok(x.t()?.contiguous()?.matmul(&scaled.contiguous()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{
        Conv2d, HookManager, KfacModel, LayerKindTag, LayerNorm, LayerRegistry, Linear,
        TrainableLayer,
    };
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Var};

    struct Single<L: TrainableLayer>(L);

    impl<L: TrainableLayer> KfacModel for Single<L> {
        fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
            vec![&mut self.0]
        }
    }

    fn register<L: TrainableLayer>(layer: L) -> LayerHandle {
        let mut model = Single(layer);
        let hooks = HookManager::new(1);
        let all = [LayerKindTag::Linear, LayerKindTag::Conv2d, LayerKindTag::Normalization];
        let registry = LayerRegistry::build(&mut model, &all, &hooks).unwrap();
        registry.layers()[0].clone()
    }

    #[test]
    fn test_linear_a_with_bias() {
        let device = Device::Cpu;
        let layer = register(Linear::init("fc", 2, 3, true, &device).unwrap());
        let a = Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap();

        let factor = compute_a(&a, &layer).unwrap().to_vec2::<f32>().unwrap();
        // rows [1, 2, 1] and [3, 4, 1], averaged over the batch of 2
        let expected = [[5.0, 7.0, 2.0], [7.0, 10.0, 3.0], [2.0, 3.0, 1.0]];
        for (row, want) in factor.iter().zip(expected.iter()) {
            for (v, w) in row.iter().zip(want.iter()) {
                assert_relative_eq!(*v, *w as f32, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_linear_a_averages_middle_dims() {
        let device = Device::Cpu;
        let layer = register(Linear::init("fc", 2, 3, false, &device).unwrap());
        let a = Tensor::new(&[[[1f32, 0.], [3., 2.]]], &device).unwrap();
        let factor = compute_a(&a, &layer).unwrap().to_vec2::<f32>().unwrap();
        // mean row is [2, 1]
        assert_eq!(factor, vec![vec![4.0, 2.0], vec![2.0, 1.0]]);
    }

    #[test]
    fn test_linear_g_batch_scaling() {
        let device = Device::Cpu;
        let layer = register(Linear::init("fc", 2, 2, false, &device).unwrap());
        let g = Tensor::new(&[[1f32, 0.], [0., 1.]], &device).unwrap();

        let averaged = compute_g(&g, &layer, true).unwrap().to_vec2::<f32>().unwrap();
        let summed = compute_g(&g, &layer, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(averaged, vec![vec![2.0, 0.0], vec![0.0, 2.0]]);
        assert_eq!(summed, vec![vec![0.5, 0.0], vec![0.0, 0.5]]);
    }

    #[test]
    fn test_patches_match_convolution() {
        let device = Device::Cpu;
        let geometry = Conv2dGeometry {
            kernel: (3, 3),
            stride: 1,
            padding: 1,
        };
        let conv = Conv2d::init("conv", 2, 3, geometry, false, &device).unwrap();
        let x = Tensor::arange(0f32, 50., &device)
            .unwrap()
            .reshape((1, 2, 5, 5))
            .unwrap()
            .affine(0.1, 0.0)
            .unwrap();

        let (patches, spatial) = extract_patches(&x, geometry).unwrap();
        assert_eq!(spatial, 25);
        assert_eq!(patches.dims(), &[25, 18]);

        // patches · Wᵀ reproduces the convolution output
        let w = conv.weight().as_tensor().flatten_from(1).unwrap();
        let via_patches = patches.matmul(&w.t().unwrap()).unwrap();
        let direct = x
            .conv2d(conv.weight().as_tensor(), 1, 1, 1, 1)
            .unwrap()
            .permute((0, 2, 3, 1))
            .unwrap()
            .reshape((25, 3))
            .unwrap();
        let diff = (via_patches - direct)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn test_conv_factor_dims() {
        let device = Device::Cpu;
        let geometry = Conv2dGeometry {
            kernel: (3, 3),
            stride: 2,
            padding: 0,
        };
        let layer = register(Conv2d::init("conv", 2, 4, geometry, true, &device).unwrap());
        let x = Tensor::ones((3, 2, 7, 7), DType::F32, &device).unwrap();
        let g = Tensor::ones((3, 4, 3, 3), DType::F32, &device).unwrap();

        assert_eq!(compute_a(&x, &layer).unwrap().dims(), &[19, 19]);
        assert_eq!(compute_g(&g, &layer, true).unwrap().dims(), &[4, 4]);
    }

    #[test]
    fn test_normalization_factors() {
        let device = Device::Cpu;
        let layer = register(LayerNorm::init("norm", 4, true, &device).unwrap());
        let xhat = Tensor::new(&[[1f32, -1., 1., -1.], [2., -2., 2., -2.]], &device).unwrap();

        let a = compute_a(&xhat, &layer).unwrap().to_vec2::<f32>().unwrap();
        // per-sample RMS is [1, 2]; with the bias column: [[2.5, 1.5], [1.5, 1]]
        assert_relative_eq!(a[0][0], 2.5, epsilon = 1e-5);
        assert_relative_eq!(a[0][1], 1.5, epsilon = 1e-5);
        assert_relative_eq!(a[1][1], 1.0, epsilon = 1e-5);

        let g = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        assert_eq!(compute_g(&g, &layer, true).unwrap().dims(), &[4, 4]);
    }

    #[test]
    fn test_wrong_feature_count_is_a_shape_error() {
        let device = Device::Cpu;
        let weight = Var::zeros((3, 2), DType::F32, &device).unwrap();
        let layer = register(Linear::new("fc", weight, None));
        let a = Tensor::ones((2, 5), DType::F32, &device).unwrap();
        assert!(matches!(compute_a(&a, &layer), Err(Error::Shape(_))));
    }
}
