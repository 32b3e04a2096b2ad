//! ONNX Runtime backed ensemble member.
//!
//! The fundus models are Keras networks exported to ONNX, so they take NHWC
//! input and usually end in a softmax.

use std::path::Path;
use std::sync::Arc;

use ndarray::CowArray;
use once_cell::sync::Lazy;
use ort::{
    GraphOptimizationLevel, SessionBuilder, environment::Environment, session::Session,
    tensor::OrtOwnedTensor, value::Value,
};

use crate::class::ProbabilityVector;
use crate::classifier::{Classifier, check_shape};
use crate::config::{EngineConfig, OutputKind};
use crate::error::InferenceError;
use crate::preprocess::ImageTensor;
use crate::{ClassifierSet, ModelRole};

static ORT_ENV: Lazy<Result<Arc<Environment>, String>> = Lazy::new(|| {
    Environment::builder()
        .with_name("fundus-ensemble")
        .build()
        .map(|env| env.into_arc())
        .map_err(|e| e.to_string())
});

pub struct OnnxClassifier {
    name: String,
    session: Session,
    input_shape: [usize; 4],
    output: OutputKind,
}

impl OnnxClassifier {
    pub fn new(path: &Path, output: OutputKind, input_size: u32) -> anyhow::Result<Self> {
        if !path.exists() {
            anyhow::bail!("model file missing: {}", path.display());
        }
        let env = (*ORT_ENV)
            .as_ref()
            .map_err(|e| anyhow::anyhow!("failed to initialize ONNX Runtime: {e}"))?
            .clone();
        let session = SessionBuilder::new(&env)?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_model_from_file(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        tracing::info!("loaded {name} from {}", path.display());
        Ok(Self {
            name,
            session,
            input_shape: ImageTensor::expected_shape(input_size),
            output,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, tensor: &ImageTensor) -> Result<ProbabilityVector, InferenceError> {
        check_shape(tensor, self.input_shape)?;
        let input_array = tensor.view().into_dyn();
        let cow = CowArray::from(input_array);
        let input = Value::from_array(self.session.allocator(), &cow)
            .map_err(|e| InferenceError::Backend(format!("could not build input tensor: {e}")))?;
        let outputs: Vec<Value> = self
            .session
            .run(vec![input])
            .map_err(|e| InferenceError::Backend(e.to_string()))?;
        let first = outputs
            .first()
            .ok_or_else(|| InferenceError::Backend("model produced no output".into()))?;
        let scores: OrtOwnedTensor<f32, _> = first
            .try_extract()
            .map_err(|e| InferenceError::Backend(e.to_string()))?;
        let scores: Vec<f32> = scores.view().iter().cloned().collect();
        match self.output {
            OutputKind::Probabilities => ProbabilityVector::new(&scores),
            OutputKind::Logits => ProbabilityVector::from_logits(&scores),
        }
    }
}

/// Loads all three ensemble members described by `cfg`.
pub fn load_classifier_set(cfg: &EngineConfig) -> anyhow::Result<ClassifierSet> {
    let load = |role: ModelRole| -> anyhow::Result<Arc<dyn Classifier>> {
        let model = OnnxClassifier::new(
            &cfg.model_path(role),
            cfg.models.get(role).output,
            cfg.input_size,
        )
        .map_err(|e| e.context(format!("loading {role} model")))?;
        Ok(Arc::new(model))
    };
    Ok(ClassifierSet::new(
        load(ModelRole::Primary)?,
        load(ModelRole::SecondaryA)?,
        load(ModelRole::SecondaryB)?,
    ))
}
