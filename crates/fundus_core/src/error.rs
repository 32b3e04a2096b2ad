use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::classifier::ModelRole;

/// Failures while turning a raw image into an [`ImageTensor`](crate::ImageTensor).
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("input is not a decodable image: {0}")]
    Decode(String),
    #[error("image cannot be coerced to 3 channels: {0}")]
    ChannelMismatch(String),
    #[error("failed to read image {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised by a single classifier.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("tensor shape {actual:?} does not match model input {expected:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("model returned an invalid probability vector: {0}")]
    InvalidOutput(String),
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("no prediction after {0:?}")]
    Timeout(Duration),
}

/// Pipeline stage at which a classification request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    Inference,
    Cancelled,
}

/// Error surfaced to the presentation layer by [`DiagnosisEngine::classify`](crate::DiagnosisEngine::classify).
///
/// No diagnosis is ever substituted for a failed request.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("{role} classifier failed: {source}")]
    Inference {
        role: ModelRole,
        #[source]
        source: InferenceError,
    },
    #[error("request was cancelled")]
    Cancelled,
}

impl ClassificationError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Preprocess(_) => Stage::Preprocess,
            Self::Inference { .. } => Stage::Inference,
            Self::Cancelled => Stage::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
