use crate::{decoder::DecodedImage, detection::Detection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Session mutex poisoned: {0}")]
    Poisoned(String),
    #[error("Failed to build input tensor: {0}")]
    Input(String),
    #[error("Inference failed: {0}")]
    Run(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// Forward pass over one decoded image. Implementations are called from the
/// blocking pool and must be safe to share between concurrent requests.
/// Returned detections are in model order and must not be re-sorted downstream.
pub trait ModelService: Send + Sync + 'static {
    fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>, InferenceError>;
}
