//! Eigenbasis preconditioning of layer gradients
//!
//! With `A = QA·diag(dA)·QAᵀ` and `G = QG·diag(dG)·QGᵀ`, the corrected gradient
//! of a layer is `QG · ((QGᵀ · grad · QA) ⊘ (dG ⊗ dA + damping)) · QAᵀ`, where
//! `grad` is the weight gradient formatted as `(outputs, inputs)` with the bias
//! gradient appended as an extra column.

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::factors::FactorState;
use crate::layers::{LayerHandle, LayerKind};

/// Corrected gradient split back into parameter shapes
#[derive(Debug, Clone)]
pub struct PreconditionedGrad {
    /// Shaped like the weight
    pub weight: Tensor,
    /// Shaped like the bias, when the layer has one
    pub bias: Option<Tensor>,
}

/// Format a layer's gradients as one `(g_dim, a_dim)` matrix
pub fn format_grad(
    layer: &LayerHandle,
    weight_grad: &Tensor,
    bias_grad: Option<&Tensor>,
) -> Result<Tensor> {
    let grad = match layer.kind() {
        LayerKind::Linear => weight_grad.clone(),
        LayerKind::Conv2d(_) => weight_grad.flatten_from(1)?,
        LayerKind::Normalization => weight_grad.reshape((weight_grad.elem_count(), 1))?,
    };

    let grad = match (layer.has_bias(), bias_grad) {
        (false, _) => grad,
        (true, Some(bias)) => {
            let bias = bias.reshape((bias.elem_count(), 1))?;
            Tensor::cat(&[&grad, &bias], 1)?
        }
        (true, None) => {
            return Err(Error::shape(format!(
                "layer '{}' has a bias but no bias gradient",
                layer.name()
            )))
        }
    };

    let expected = [layer.g_dim(), layer.a_dim()];
    if grad.dims() != expected.as_slice() {
        return Err(Error::shape(format!(
            "layer '{}' gradient formats to {:?}, expected {:?}",
            layer.name(),
            grad.dims(),
            expected
        )));
    }
    Ok(grad)
}

/// `dG ⊗ dA + damping`, shaped `(g_dim, a_dim)`
pub fn damped_denominator(dg: &Tensor, da: &Tensor, damping: f64) -> Result<Tensor> {
    let outer = dg.unsqueeze(1)?.broadcast_mul(&da.unsqueeze(0)?)?;
    Ok(outer.affine(1.0, damping)?)
}

/// Precondition a formatted gradient with the layer's current eigenbases
pub fn precondition(
    grad: &Tensor,
    a: &FactorState,
    g: &FactorState,
    damping: f64,
) -> Result<Tensor> {
    let (rows, cols) = grad.dims2()?;
    if rows != g.dim() || cols != a.dim() {
        return Err(Error::shape(format!(
            "gradient {}x{} does not match factors G {} and A {}",
            rows,
            cols,
            g.dim(),
            a.dim()
        )));
    }

    let qa = a.eigenvectors();
    let qg = g.eigenvectors();
    let grad = grad.to_dtype(qa.dtype())?;

    let v1 = qg.t()?.contiguous()?.matmul(&grad)?.matmul(qa)?;
    let v2 = v1.div(&damped_denominator(g.eigenvalues(), a.eigenvalues(), damping)?)?;
    Ok(qg.matmul(&v2)?.matmul(&qa.t()?.contiguous()?)?)
}

/// Split a `(g_dim, a_dim)` corrected gradient into weight and bias pieces
pub fn split_grad(v: &Tensor, layer: &LayerHandle) -> Result<PreconditionedGrad> {
    let (_, cols) = v.dims2()?;
    let weight_shape = layer.weight().shape().clone();

    match layer.bias() {
        Some(bias) => {
            let weight = v.narrow(1, 0, cols - 1)?.reshape(weight_shape)?;
            let bias = v
                .narrow(1, cols - 1, 1)?
                .reshape(bias.shape().clone())?;
            Ok(PreconditionedGrad {
                weight,
                bias: Some(bias),
            })
        }
        None => Ok(PreconditionedGrad {
            weight: v.reshape(weight_shape)?,
            bias: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{FactorSide, LayerState};
    use crate::layers::{
        HookManager, KfacModel, LayerKindTag, LayerRegistry, Linear, TrainableLayer,
    };
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use proptest::prelude::*;

    struct One(Linear);

    impl KfacModel for One {
        fn layers_mut(&mut self) -> Vec<&mut dyn TrainableLayer> {
            vec![&mut self.0]
        }
    }

    fn linear_handle(bias: bool) -> LayerHandle {
        let mut model = One(Linear::init("fc", 3, 2, bias, &Device::Cpu).unwrap());
        let hooks = HookManager::new(1);
        LayerRegistry::build(&mut model, &[LayerKindTag::Linear], &hooks)
            .unwrap()
            .layers()[0]
            .clone()
    }

    /// Factor state with identity eigenvectors and the given eigenvalues
    fn diagonal_state(values: &[f32]) -> FactorState {
        let device = Device::Cpu;
        let n = values.len();
        let mut state =
            FactorState::init(&Tensor::zeros((n, n), DType::F32, &device).unwrap()).unwrap();
        state.eigenvectors = Tensor::eye(n, DType::F32, &device).unwrap();
        state.eigenvalues = Tensor::new(values, &device).unwrap();
        state
    }

    #[test]
    fn test_diagonal_factors_divide_elementwise() {
        let a = diagonal_state(&[1.0, 2.0]);
        let g = diagonal_state(&[3.0]);
        let grad = Tensor::new(&[[6f32, 12.]], &Device::Cpu).unwrap();

        let v = precondition(&grad, &a, &g, 1.0).unwrap().to_vec2::<f32>().unwrap();
        // 6 / (3·1 + 1), 12 / (3·2 + 1)
        assert_relative_eq!(v[0][0], 1.5, epsilon = 1e-6);
        assert_relative_eq!(v[0][1], 12.0 / 7.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let a = diagonal_state(&[1.0, 2.0]);
        let g = diagonal_state(&[3.0]);
        let grad = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(precondition(&grad, &a, &g, 1.0), Err(Error::Shape(_))));
    }

    #[test]
    fn test_format_and_split_round_trip_with_bias() {
        let device = Device::Cpu;
        let layer = linear_handle(true);
        let w = Tensor::arange(0f32, 6., &device).unwrap().reshape((2, 3)).unwrap();
        let b = Tensor::new(&[10f32, 20.], &device).unwrap();

        let formatted = format_grad(&layer, &w, Some(&b)).unwrap();
        assert_eq!(
            formatted.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0, 2.0, 10.0], vec![3.0, 4.0, 5.0, 20.0]]
        );

        let split = split_grad(&formatted, &layer).unwrap();
        assert_eq!(split.weight.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
        assert_eq!(split.bias.unwrap().to_vec1::<f32>().unwrap(), vec![10.0, 20.0]);
    }

    #[test]
    fn test_missing_bias_gradient_is_rejected() {
        let layer = linear_handle(true);
        let w = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(format_grad(&layer, &w, None).is_err());
    }

    #[test]
    fn test_precondition_with_blended_identity_factors() {
        let device = Device::Cpu;
        let layer = linear_handle(false);
        let mut state = LayerState::default();
        state
            .blend(FactorSide::A, &Tensor::eye(3, DType::F32, &device).unwrap(), 0.5)
            .unwrap();
        state
            .blend(FactorSide::G, &Tensor::eye(2, DType::F32, &device).unwrap(), 0.5)
            .unwrap();
        let a = state.a.as_mut().unwrap();
        crate::eigen::decompose_blocks(a, &[0], 0, 1e-10).unwrap();
        let g = state.g.as_mut().unwrap();
        crate::eigen::decompose_blocks(g, &[0], 0, 1e-10).unwrap();

        let grad = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        let formatted = format_grad(&layer, &grad, None).unwrap();
        let v = precondition(
            &formatted,
            state.a.as_ref().unwrap(),
            state.g.as_ref().unwrap(),
            1.0,
        )
        .unwrap();
        // identity factors: grad / (1·1 + 1)
        for value in v.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert_relative_eq!(value, 0.5, epsilon = 1e-5);
        }
    }

    proptest! {
        #[test]
        fn prop_denominator_is_at_least_damping(
            dg in proptest::collection::vec(0.0f32..100.0, 1..6),
            da in proptest::collection::vec(0.0f32..100.0, 1..6),
            damping in 1e-6f64..1.0,
        ) {
            let device = Device::Cpu;
            let dg = Tensor::new(dg.as_slice(), &device).unwrap();
            let da = Tensor::new(da.as_slice(), &device).unwrap();
            let denom = damped_denominator(&dg, &da, damping).unwrap();
            for value in denom.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
                prop_assert!(value as f64 >= damping * (1.0 - 1e-6));
            }
        }
    }
}
