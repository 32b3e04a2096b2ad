use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::class::ProbabilityVector;
use crate::error::InferenceError;
use crate::preprocess::ImageTensor;

/// A trained model that scores one image tensor.
///
/// Implementations must not mutate shared state in `predict`; the engine
/// calls the three ensemble members concurrently on the same tensor.
pub trait Classifier: Send + Sync {
    /// Human readable model name for logs.
    fn name(&self) -> &str;

    fn predict(&self, tensor: &ImageTensor) -> Result<ProbabilityVector, InferenceError>;
}

/// Position of a model in the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Primary,
    SecondaryA,
    SecondaryB,
}

impl ModelRole {
    pub const ALL: [ModelRole; 3] = [Self::Primary, Self::SecondaryA, Self::SecondaryB];

    pub fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::SecondaryA => 1,
            Self::SecondaryB => 2,
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::SecondaryA => "secondary-A",
            Self::SecondaryB => "secondary-B",
        })
    }
}

/// The three loaded ensemble members, built once and handed to the engine.
#[derive(Clone)]
pub struct ClassifierSet {
    primary: Arc<dyn Classifier>,
    secondary_a: Arc<dyn Classifier>,
    secondary_b: Arc<dyn Classifier>,
}

impl ClassifierSet {
    pub fn new(
        primary: Arc<dyn Classifier>,
        secondary_a: Arc<dyn Classifier>,
        secondary_b: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            primary,
            secondary_a,
            secondary_b,
        }
    }

    pub fn get(&self, role: ModelRole) -> &Arc<dyn Classifier> {
        match role {
            ModelRole::Primary => &self.primary,
            ModelRole::SecondaryA => &self.secondary_a,
            ModelRole::SecondaryB => &self.secondary_b,
        }
    }
}

impl fmt::Debug for ClassifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierSet")
            .field("primary", &self.primary.name())
            .field("secondary_a", &self.secondary_a.name())
            .field("secondary_b", &self.secondary_b.name())
            .finish()
    }
}

/// Rejects tensors whose shape differs from what a model was built for.
pub fn check_shape(tensor: &ImageTensor, expected: [usize; 4]) -> Result<(), InferenceError> {
    let actual = tensor.shape();
    if actual != expected {
        return Err(InferenceError::Shape {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
