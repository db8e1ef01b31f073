//! KFAC - Distributed Kronecker-factored gradient preconditioning for candle
//!
//! This crate approximates the Fisher information of every supported layer
//! as the Kronecker product of two small factors, `A` (from layer inputs) and
//! `G` (from gradients w.r.t. layer outputs), and uses their eigenbases to
//! turn raw gradients into approximate natural gradients before the base
//! optimizer steps.
//!
//! ```rust,ignore
//! use candle_nn::{Optimizer, SGD};
//! use kfac::{Kfac, KfacConfig};
//!
//! let mut kfac = Kfac::new(&mut model, KfacConfig::default())?;
//! let mut sgd = SGD::new(model.parameters(), 0.1)?;
//!
//! for (epoch, batch) in batches {
//!     let loss = model.loss(&batch)?;
//!     let mut grads = loss.backward()?;
//!     let stats = kfac.step(&mut grads, Some(epoch))?;
//!     sgd.step(&grads)?;
//! }
//! ```
//!
//! Data-parallel workers each build their own [`Kfac`] with one communicator
//! of a group (see [`comm`]) and must average their gradients before calling
//! [`Kfac::step`].

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod comm;
pub mod config;
pub mod eigen;
pub mod error;
pub mod factors;
pub mod layers;
pub mod logging;
pub mod optimizer;
pub mod precondition;
pub mod rescale;
pub mod scheduler;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-exports
pub use comm::{
    build_communicators, Communicator, LocalCommunicator, ReduceOp, ThreadCommunicator,
    ThreadGroup,
};
pub use config::{CommBackend, GradientRescale, KfacConfig, ScheduleConfig};
pub use error::{Error, Result};
pub use factors::FactorSide;
pub use layers::{
    Conv2d, Conv2dGeometry, HookManager, KfacModel, LayerHandle, LayerId, LayerKind,
    LayerKindTag, LayerNorm, Linear, TrainableLayer,
};
pub use optimizer::{BlockAssignment, HyperParams, Kfac, StepStats};
pub use scheduler::{KfacParamScheduler, Schedule};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
