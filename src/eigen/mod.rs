//! Block-diagonal eigendecomposition scheduling
//!
//! Each factor is split into `n` diagonal blocks. Blocks are assigned to
//! worker ranks round-robin through a shared [`RankCycle`]; the owner of a
//! block writes its eigenpairs into the block region of the eigenbuffers and
//! every other rank writes zeros there, so a sum-reduction across workers
//! reassembles the full buffers.

use std::ops::Range;

use candle_core::Tensor;
use nalgebra::DMatrix;
use tracing::trace;

use crate::error::{Error, Result};
use crate::factors::FactorState;
use crate::utils::tensor::to_rows_f64;

/// Round-robin rank iterator with an explicit cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankCycle {
    size: usize,
    cursor: usize,
}

impl RankCycle {
    /// Cycle over ranks `0..size`
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            cursor: 0,
        }
    }

    /// Restart at rank 0
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// The next `n` ranks, wrapping around
    pub fn next(&mut self, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| {
                let rank = self.cursor;
                self.cursor = (self.cursor + 1) % self.size;
                rank
            })
            .collect()
    }

    /// Rank the next call starts at
    pub fn position(&self) -> usize {
        self.cursor
    }
}

/// Row/column range of diagonal block `index` out of `count` for a `dim`-sized factor.
///
/// Blocks have `dim / count` rows; the last one absorbs the remainder.
pub fn block_boundary(index: usize, count: usize, dim: usize) -> Result<Range<usize>> {
    if count == 0 || index >= count || count > dim {
        return Err(Error::internal(format!(
            "invalid diagonal block {} of {} for dimension {}",
            index, count, dim
        )));
    }
    let len = dim / count;
    let start = index * len;
    let end = if index + 1 == count { dim } else { start + len };
    Ok(start..end)
}

/// Symmetric eigendecomposition of a row-major `n × n` block.
///
/// The block is symmetrized first. Eigenvalues `<= eps` are zeroed. Returns
/// `(eigenvalues, eigenvectors)` with the eigenvectors as columns, row-major.
pub fn symmetric_eigen(block: &[f64], n: usize, eps: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    if block.len() != n * n {
        return Err(Error::shape(format!(
            "eigen block has {} entries, expected {}x{}",
            block.len(),
            n,
            n
        )));
    }
    if block.iter().any(|v| !v.is_finite()) {
        return Err(Error::eigen("factor block contains non-finite values"));
    }

    let m = DMatrix::from_row_slice(n, n, block);
    let m = (&m + m.transpose()) * 0.5;
    let eigen = m.symmetric_eigen();

    let values = eigen
        .eigenvalues
        .iter()
        .map(|&v| if v > eps { v } else { 0.0 })
        .collect();
    let vectors = eigen.eigenvectors;
    let mut rows = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            rows.push(vectors[(i, j)]);
        }
    }
    Ok((values, rows))
}

/// Recompute the eigenbuffers of one factor for the blocks owned by `rank`.
///
/// `ranks[i]` owns block `i`; the block count is capped at the factor
/// dimension. Regions outside every diagonal block are left untouched.
/// Returns the number of blocks computed locally.
pub fn decompose_blocks(
    state: &mut FactorState,
    ranks: &[usize],
    rank: usize,
    eps: f64,
) -> Result<usize> {
    let dim = state.dim();
    let count = ranks.len().min(dim);
    let (dtype, device) = (state.factor.dtype(), state.factor.device().clone());
    let mut computed = 0;

    for (index, &owner) in ranks.iter().take(count).enumerate() {
        let range = block_boundary(index, count, dim)?;
        let len = range.len();

        let (values, vectors) = if owner == rank {
            let block = state
                .factor
                .narrow(0, range.start, len)?
                .narrow(1, range.start, len)?;
            let (values, vectors) = symmetric_eigen(&to_rows_f64(&block)?, len, eps)?;
            computed += 1;
            trace!("Rank {} decomposed block {} ({:?})", rank, index, range);
            (
                Tensor::from_vec(values, len, &device)?.to_dtype(dtype)?,
                Tensor::from_vec(vectors, (len, len), &device)?.to_dtype(dtype)?,
            )
        } else {
            (
                Tensor::zeros(len, dtype, &device)?,
                Tensor::zeros((len, len), dtype, &device)?,
            )
        };

        state.eigenvalues = state.eigenvalues.slice_assign(&[range.clone()], &values)?;
        state.eigenvectors = state
            .eigenvectors
            .slice_assign(&[range.clone(), range], &vectors)?;
    }
    Ok(computed)
}

/// Reconstruct `Q · diag(d) · Qᵀ` from a factor's eigenbuffers
pub fn reconstruct(state: &FactorState) -> Result<Tensor> {
    let q = state.eigenvectors();
    let scaled = q.broadcast_mul(&state.eigenvalues().unsqueeze(0)?)?;
    let qt = q.t()?.contiguous()?;
    Ok(scaled.matmul(&qt)?)
}
