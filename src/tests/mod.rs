//! End-to-end scenarios for the preconditioner
//!
//! Unit tests live next to their modules; these drive [`crate::Kfac`] through
//! full forward/backward/step cycles on small deterministic models.

pub mod test_utils;
