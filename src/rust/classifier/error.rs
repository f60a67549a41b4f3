use std::path::PathBuf;

use ort::Error as OrtError;
use thiserror::Error;

use crate::loss::LossError;
use crate::model_manager::FetchError;

/// Represents the different types of errors that can occur while assembling,
/// persisting or running a transfer-learning model.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Pretrained weights could not be fetched, verified or loaded
    #[error("Pretrained backbone unavailable: {0}")]
    ResourceUnavailable(String),
    /// The checkpoint path does not resolve to a valid persisted model
    #[error("Checkpoint not found at {path:?}: {reason}")]
    CheckpointNotFound { path: PathBuf, reason: String },
    /// Two tensors (or a tensor and a layer) disagree on a dimension
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },
    /// A trainability range does not fit the model's layer list
    #[error("Invalid layer range [{from}, {to}) for a model with {len} layers")]
    InvalidLayerRange { from: usize, to: usize, len: usize },
    /// The assembly configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Image inference was requested on a model loaded without its backbone
    #[error("No feature extractor attached to model")]
    NoBackbone,
    /// The feature extractor failed while running
    #[error("Backbone error: {0}")]
    Backbone(String),
    #[error("Loss error: {0}")]
    Loss(#[from] LossError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FetchError> for AssemblyError {
    fn from(err: FetchError) -> Self {
        AssemblyError::ResourceUnavailable(err.to_string())
    }
}

impl From<OrtError> for AssemblyError {
    fn from(err: OrtError) -> Self {
        AssemblyError::Backbone(err.to_string())
    }
}

impl AssemblyError {
    pub(crate) fn checkpoint_not_found(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        AssemblyError::CheckpointNotFound {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
