use std::collections::BTreeSet;

use serde::Serialize;

use crate::class::{DiagnosticClass, Indicator, ProbabilityVector};
use crate::classifier::ModelRole;
use crate::fusion::{FusionOutcome, FusionPath};

/// Finished diagnosis handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisResult {
    pub final_label: DiagnosticClass,
    /// Confidence of the final label in `[0, 100]`.
    pub confidence_percent: f32,
    pub is_unhealthy: bool,
    /// Indicators the presenter enables; every other indicator is disabled.
    pub enabled_labels: BTreeSet<Indicator>,
    pub final_vector: ProbabilityVector,
    /// Fusion rule behind `final_vector`; unknown when mapped from a bare vector.
    pub fusion_path: Option<FusionPath>,
    /// Raw output of each ensemble member, kept for audit.
    pub model_outputs: Vec<(ModelRole, ProbabilityVector)>,
}

impl DiagnosisResult {
    pub fn is_enabled(&self, indicator: Indicator) -> bool {
        self.enabled_labels.contains(&indicator)
    }

    /// Indicators the presenter must disable.
    pub fn disabled_labels(&self) -> BTreeSet<Indicator> {
        Indicator::ALL
            .into_iter()
            .filter(|i| !self.enabled_labels.contains(i))
            .collect()
    }
}

/// Indicators that may be shown together with `class`.
///
/// Healthy is exclusive; each disease pairs with the derived Unhealthy flag.
pub fn indicators_for(class: DiagnosticClass) -> BTreeSet<Indicator> {
    let set: &[Indicator] = match class {
        DiagnosticClass::Healthy => &[Indicator::Healthy],
        DiagnosticClass::RetinalDetachment => &[Indicator::RetinalDetachment, Indicator::Unhealthy],
        DiagnosticClass::Rop => &[Indicator::Rop, Indicator::Unhealthy],
    };
    set.iter().copied().collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LabelMapper;

impl LabelMapper {
    /// Maps a final distribution to its label and indicator set.
    ///
    /// Exact ties pick the lowest class index (Healthy, then Retinal
    /// Detachment, then ROP).
    pub fn map_label(&self, final_vector: ProbabilityVector, confidence_percent: f32) -> DiagnosisResult {
        let final_label = final_vector.argmax();
        DiagnosisResult {
            final_label,
            confidence_percent,
            is_unhealthy: final_label != DiagnosticClass::Healthy,
            enabled_labels: indicators_for(final_label),
            final_vector,
            fusion_path: None,
            model_outputs: Vec::new(),
        }
    }

    /// Builds the full result from a fusion outcome plus the per-model outputs.
    pub fn map_outcome(
        &self,
        outcome: &FusionOutcome,
        model_outputs: Vec<(ModelRole, ProbabilityVector)>,
    ) -> DiagnosisResult {
        DiagnosisResult {
            fusion_path: Some(outcome.path),
            model_outputs,
            ..self.map_label(outcome.final_vector, outcome.confidence_percent)
        }
    }
}
