//! Error types for the KFAC preconditioner

use thiserror::Error;

use crate::factors::FactorSide;

/// Main error type for KFAC operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A registered layer did not fire its capture hooks during a factor update window
    #[error("Missing captured {side} for layer '{layer}': hooks did not fire this factor update window")]
    MissingCapture {
        /// Layer display name
        layer: String,
        /// Which factor side was missing
        side: FactorSide,
    },

    /// Gradient or factor shape mismatch
    #[error("Shape error: {0}")]
    Shape(String),

    /// Collective communication failure
    #[error("Communication error: {0}")]
    Communication(String),

    /// Eigendecomposition failure
    #[error("Eigendecomposition error: {0}")]
    Eigen(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for KFAC operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a missing-capture error
    pub fn missing_capture(layer: impl Into<String>, side: FactorSide) -> Self {
        Self::MissingCapture {
            layer: layer.into(),
            side,
        }
    }

    /// Create a shape error
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication(msg.into())
    }

    /// Create an eigendecomposition error
    pub fn eigen(msg: impl Into<String>) -> Self {
        Self::Eigen(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
