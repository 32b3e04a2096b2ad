use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::ModelRole;
use crate::error::ConfigError;
use crate::preprocess::{DEFAULT_INPUT_SIZE, ImagePreprocessor, MAX_INPUT_SIZE, ResizeFilter};

/// How a model's raw output should be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// The model ends in a softmax layer.
    #[default]
    Probabilities,
    Logits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub output: OutputKind,
}

impl ModelConfig {
    fn named(file: &str) -> Self {
        Self {
            path: PathBuf::from(file),
            output: OutputKind::Probabilities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub primary: ModelConfig,
    pub secondary_a: ModelConfig,
    pub secondary_b: ModelConfig,
}

impl ModelsConfig {
    pub fn get(&self, role: ModelRole) -> &ModelConfig {
        match role {
            ModelRole::Primary => &self.primary,
            ModelRole::SecondaryA => &self.secondary_a,
            ModelRole::SecondaryB => &self.secondary_b,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            primary: ModelConfig::named("xception_rop_model.onnx"),
            secondary_a: ModelConfig::named("inceptionv3_rop_model.onnx"),
            secondary_b: ModelConfig::named("densenet_rop_model.onnx"),
        }
    }
}

/// Engine settings, usually read from a TOML file.
///
/// Fusion weights and the confidence threshold are fixed and not configurable here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory relative model paths are resolved against.
    pub model_dir: PathBuf,
    pub input_size: u32,
    pub resize_filter: ResizeFilter,
    /// Per-classifier time limit in milliseconds; 0 disables it.
    pub timeout_ms: u64,
    pub models: ModelsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            input_size: DEFAULT_INPUT_SIZE,
            resize_filter: ResizeFilter::default(),
            timeout_ms: 30_000,
            models: ModelsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_toml_str(&raw)?;
        if cfg.model_dir.is_relative()
            && let Some(parent) = path.parent()
        {
            cfg.model_dir = parent.join(&cfg.model_dir);
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_size == 0 {
            return Err(ConfigError::Invalid("input_size must be positive".into()));
        }
        if self.input_size > MAX_INPUT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "input_size {} exceeds {MAX_INPUT_SIZE}",
                self.input_size
            )));
        }
        for role in ModelRole::ALL {
            if self.models.get(role).path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("{role} model path is empty")));
            }
        }
        Ok(())
    }

    /// Absolute or `model_dir`-relative path of a model file.
    pub fn model_path(&self, role: ModelRole) -> PathBuf {
        let path = &self.models.get(role).path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.model_dir.join(path)
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn preprocessor(&self) -> ImagePreprocessor {
        ImagePreprocessor::new(self.input_size, self.resize_filter)
    }
}
