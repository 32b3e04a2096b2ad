//! Confidence-gated weighted fusion of the three ensemble outputs.
//!
//! When the primary model's top probability reaches the threshold it is
//! trusted alone. Otherwise the final distribution is the convex combination
//! `w_p * primary + w_a * secondary_a + w_b * secondary_b`.

use serde::Serialize;

use crate::class::ProbabilityVector;
use crate::error::ConfigError;

/// Inclusive primary-confidence gate.
pub const CONFIDENCE_THRESHOLD: f32 = 0.9;

/// Blend weights applied when the primary model is not confident enough.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    primary: f32,
    secondary_a: f32,
    secondary_b: f32,
}

impl FusionWeights {
    pub const DEFAULT: FusionWeights = FusionWeights {
        primary: 0.7,
        secondary_a: 0.2,
        secondary_b: 0.1,
    };

    pub fn new(primary: f32, secondary_a: f32, secondary_b: f32) -> Result<Self, ConfigError> {
        let weights = Self {
            primary,
            secondary_a,
            secondary_b,
        };
        weights.check()?;
        Ok(weights)
    }

    pub fn primary(&self) -> f32 {
        self.primary
    }

    pub fn secondary_a(&self) -> f32 {
        self.secondary_a
    }

    pub fn secondary_b(&self) -> f32 {
        self.secondary_b
    }

    /// Non-negative and summing to 1, so blending stays a convex combination.
    fn check(&self) -> Result<(), ConfigError> {
        let weights = [self.primary, self.secondary_a, self.secondary_b];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fusion weights must be non-negative, got {weights:?}"
            )));
        }
        let sum: f32 = weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "fusion weights must sum to 1, got {sum}"
            )));
        }
        Ok(())
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Which rule produced the final distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPath {
    PrimaryOnly,
    Blended,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionOutcome {
    pub final_vector: ProbabilityVector,
    /// `max(final_vector) * 100`.
    pub confidence_percent: f32,
    pub path: FusionPath,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleFusion {
    weights: FusionWeights,
    threshold: f32,
}

impl Default for EnsembleFusion {
    fn default() -> Self {
        Self {
            weights: FusionWeights::DEFAULT,
            threshold: CONFIDENCE_THRESHOLD,
        }
    }
}

impl EnsembleFusion {
    pub fn new(weights: FusionWeights, threshold: f32) -> Result<Self, ConfigError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence threshold must be in (0, 1], got {threshold}"
            )));
        }
        weights.check()?;
        Ok(Self { weights, threshold })
    }

    pub fn weights(&self) -> FusionWeights {
        self.weights
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn fuse(
        &self,
        primary: &ProbabilityVector,
        secondary_a: &ProbabilityVector,
        secondary_b: &ProbabilityVector,
    ) -> FusionOutcome {
        let (final_vector, path) = if primary.max() >= self.threshold {
            (*primary, FusionPath::PrimaryOnly)
        } else {
            let w = self.weights;
            let blended = ProbabilityVector::weighted_sum(&[
                (w.primary, primary),
                (w.secondary_a, secondary_a),
                (w.secondary_b, secondary_b),
            ]);
            (blended, FusionPath::Blended)
        };
        FusionOutcome {
            confidence_percent: final_vector.max() * 100.0,
            final_vector,
            path,
        }
    }
}
