//! Kronecker factor estimation and running averages
//!
//! [`estimate`] turns one captured activation or output gradient into a
//! factor estimate; [`running`] keeps the per-layer exponential moving average
//! together with the eigenbuffers computed from it.

pub mod estimate;
pub mod running;

pub use estimate::{compute_a, compute_g, extract_patches};
pub use running::{update_running_avg, FactorState, LayerState};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the Kronecker product a factor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorSide {
    /// Activation side, from layer inputs
    A,
    /// Gradient side, from gradients w.r.t. layer outputs
    G,
}

impl FactorSide {
    /// Both sides, A first
    pub const BOTH: [FactorSide; 2] = [FactorSide::A, FactorSide::G];
}

impl fmt::Display for FactorSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorSide::A => write!(f, "activations (A)"),
            FactorSide::G => write!(f, "output gradients (G)"),
        }
    }
}
