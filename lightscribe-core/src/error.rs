use thiserror::Error;

/// Failures raised by a model loader.
///
/// `Clone` because one failed load is handed to every caller that was
/// waiting on the same model id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("model {model_id} has an unusable format: {reason}")]
    ModelFormat { model_id: String, reason: String },

    #[error("loader for {model_id} aborted before producing a model")]
    LoaderAborted { model_id: String },
}

/// All errors produced by lightscribe-core.
#[derive(Debug, Error)]
pub enum ScribeError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("unsupported audio input: {reason}")]
    UnsupportedFormat { reason: String },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[cfg(feature = "onnx")]
    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("transcription cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScribeError {
    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScribeError>;
