//! Utility functions for the KFAC preconditioner

/// Tensor helpers
///
/// Reductions go through `f64` so the results do not depend on the model's
/// floating-point dtype.
pub mod tensor {
    use candle_core::{DType, Tensor};

    use crate::error::{Error, Result};

    /// Read a single-element tensor as `f64`
    pub fn to_scalar_f64(t: &Tensor) -> Result<f64> {
        let t = t.to_dtype(DType::F64)?;
        let value = match t.rank() {
            0 => t.to_scalar::<f64>()?,
            _ if t.elem_count() == 1 => t.flatten_all()?.get(0)?.to_scalar::<f64>()?,
            _ => {
                return Err(Error::shape(format!(
                    "expected a single element, got shape {:?}",
                    t.dims()
                )))
            }
        };
        Ok(value)
    }

    /// Sum of all elements as `f64`
    pub fn sum_f64(t: &Tensor) -> Result<f64> {
        to_scalar_f64(&t.to_dtype(DType::F64)?.sum_all()?)
    }

    /// Frobenius norm as `f64`
    pub fn frobenius_norm(t: &Tensor) -> Result<f64> {
        Ok(sum_f64(&t.to_dtype(DType::F64)?.sqr()?)?.sqrt())
    }

    /// Element-wise `max(x, value)`
    pub fn floor_at(x: &Tensor, value: f64) -> Result<Tensor> {
        Ok(x.affine(1.0, -value)?.relu()?.affine(1.0, value)?)
    }

    /// Element-wise `min(x, value)`
    pub fn cap_at(x: &Tensor, value: f64) -> Result<Tensor> {
        Ok(x.affine(-1.0, value)?.relu()?.affine(-1.0, value)?)
    }

    /// View a tensor as `(dim0, rest)`; rank-1 tensors become a column
    pub fn as_matrix(t: &Tensor) -> Result<Tensor> {
        let dims = t.dims();
        match dims.len() {
            0 => Ok(t.reshape((1, 1))?),
            1 => Ok(t.reshape((dims[0], 1))?),
            2 => Ok(t.clone()),
            _ => Ok(t.flatten_from(1)?),
        }
    }

    /// Row-major `f64` copy of a 2-D tensor
    pub fn to_rows_f64(t: &Tensor) -> Result<Vec<f64>> {
        Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
    }

}
