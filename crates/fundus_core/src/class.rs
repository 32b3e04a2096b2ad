use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// Number of diagnostic classes every model predicts.
pub const CLASS_COUNT: usize = 3;

/// Allowed deviation of a probability vector's sum from 1.0.
pub const SUM_TOLERANCE: f32 = 1e-4;

/// Diagnostic classes in model output order.
///
/// The ordinal indices are shared with all trained models and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticClass {
    Healthy = 0,
    RetinalDetachment = 1,
    Rop = 2,
}

impl DiagnosticClass {
    pub const ALL: [DiagnosticClass; CLASS_COUNT] =
        [Self::Healthy, Self::RetinalDetachment, Self::Rop];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::RetinalDetachment => "Retinal Detachment",
            Self::Rop => "ROP",
        }
    }
}

impl fmt::Display for DiagnosticClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Indicators a presenter can show for a diagnosis.
///
/// `Unhealthy` is derived from the final class and never predicted by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Indicator {
    Healthy,
    Unhealthy,
    RetinalDetachment,
    Rop,
}

impl Indicator {
    pub const ALL: [Indicator; 4] = [
        Self::Healthy,
        Self::Unhealthy,
        Self::RetinalDetachment,
        Self::Rop,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Unhealthy => "Unhealthy",
            Self::RetinalDetachment => "Retinal Detachment",
            Self::Rop => "ROP",
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Probability distribution over [`DiagnosticClass`], index-aligned with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProbabilityVector([f32; CLASS_COUNT]);

impl ProbabilityVector {
    /// Validates raw model output: exactly three finite, non-negative entries summing to 1.
    pub fn new(values: &[f32]) -> Result<Self, InferenceError> {
        let probs: [f32; CLASS_COUNT] = values.try_into().map_err(|_| {
            InferenceError::InvalidOutput(format!(
                "expected {CLASS_COUNT} entries, got {}",
                values.len()
            ))
        })?;
        if let Some(bad) = probs.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(InferenceError::InvalidOutput(format!(
                "entry {bad} is not a probability"
            )));
        }
        let sum: f32 = probs.iter().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(InferenceError::InvalidOutput(format!(
                "entries sum to {sum}, not 1"
            )));
        }
        Ok(Self(probs))
    }

    /// Builds a distribution from raw logits with a stable softmax.
    pub fn from_logits(logits: &[f32]) -> Result<Self, InferenceError> {
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(InferenceError::InvalidOutput("non-finite logit".into()));
        }
        Self::new(&softmax(logits))
    }

    /// Convex combination used by the fusion step; skips validation since
    /// a weighted sum of distributions with weights summing to 1 is a distribution.
    pub(crate) fn weighted_sum(parts: &[(f32, &ProbabilityVector)]) -> Self {
        let mut out = [0.0f32; CLASS_COUNT];
        for (weight, vector) in parts {
            for (acc, p) in out.iter_mut().zip(vector.0.iter()) {
                *acc += weight * p;
            }
        }
        Self(out)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn get(&self, class: DiagnosticClass) -> f32 {
        self.0[class.index()]
    }

    pub fn max(&self) -> f32 {
        self.0.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Class with the highest probability; ties go to the lowest class index.
    pub fn argmax(&self) -> DiagnosticClass {
        let mut best = 0;
        for (idx, &p) in self.0.iter().enumerate().skip(1) {
            // strict comparison keeps the earlier index on ties
            if p > self.0[best] {
                best = idx;
            }
        }
        DiagnosticClass::ALL[best]
    }
}

/// `exp(l - logsumexp(logits))` per entry; shifting by the peak keeps `exp` in range.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let peak = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_norm = peak + logits.iter().map(|l| (l - peak).exp()).sum::<f32>().ln();
    logits.iter().map(|l| (l - log_norm).exp()).collect()
}
