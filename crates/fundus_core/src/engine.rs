//! The single entry point presenters call: image in, diagnosis out.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
pub use tokio_util::sync::CancellationToken;

use crate::ImageInfo;
use crate::class::ProbabilityVector;
use crate::classifier::{ClassifierSet, ModelRole};
use crate::error::{ClassificationError, InferenceError};
use crate::fusion::EnsembleFusion;
use crate::labels::{DiagnosisResult, LabelMapper};
use crate::preprocess::{ImagePreprocessor, ImageSource, ImageTensor};

/// Default per-classifier time limit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a waiting request checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Hands out one token per submitted image and cancels the previous one,
/// so a newer submission supersedes any request still in flight.
#[derive(Debug, Default)]
pub struct RequestTracker {
    current: Mutex<Option<CancellationToken>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

pub struct DiagnosisEngine {
    classifiers: ClassifierSet,
    preprocessor: ImagePreprocessor,
    fusion: EnsembleFusion,
    mapper: LabelMapper,
    timeout: Option<Duration>,
}

impl DiagnosisEngine {
    pub fn new(classifiers: ClassifierSet) -> Self {
        Self {
            classifiers,
            preprocessor: ImagePreprocessor::default(),
            fusion: EnsembleFusion::default(),
            mapper: LabelMapper,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Loads the three ONNX models and applies the configured preprocessing and timeout.
    #[cfg(feature = "ort")]
    pub fn from_config(cfg: &crate::EngineConfig) -> anyhow::Result<Self> {
        let classifiers = crate::onnx::load_classifier_set(cfg)?;
        Ok(Self::new(classifiers)
            .with_preprocessor(cfg.preprocessor())
            .with_timeout(cfg.timeout()))
    }

    pub fn with_preprocessor(mut self, preprocessor: ImagePreprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_fusion(mut self, fusion: EnsembleFusion) -> Self {
        self.fusion = fusion;
        self
    }

    /// Per-classifier time limit; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn classifiers(&self) -> &ClassifierSet {
        &self.classifiers
    }

    pub fn classify(&self, source: impl Into<ImageSource>) -> Result<DiagnosisResult, ClassificationError> {
        self.classify_with_cancel(source, &CancellationToken::new())
    }

    pub fn classify_with_cancel(
        &self,
        source: impl Into<ImageSource>,
        cancel: &CancellationToken,
    ) -> Result<DiagnosisResult, ClassificationError> {
        let source = source.into();
        let tensor = Arc::new(self.preprocessor.preprocess(&source)?);
        if cancel.is_cancelled() {
            return Err(ClassificationError::Cancelled);
        }

        let [primary, secondary_a, secondary_b] = self.predict_all(tensor, cancel)?;
        for (role, v) in [
            (ModelRole::Primary, &primary),
            (ModelRole::SecondaryA, &secondary_a),
            (ModelRole::SecondaryB, &secondary_b),
        ] {
            tracing::debug!(%role, probs = ?v.as_slice(), "model output");
        }

        let outcome = self.fusion.fuse(&primary, &secondary_a, &secondary_b);
        tracing::debug!(path = ?outcome.path, final_vector = ?outcome.final_vector.as_slice(), "fused");

        // a request cancelled while fusing still yields nothing
        if cancel.is_cancelled() {
            return Err(ClassificationError::Cancelled);
        }
        let result = self.mapper.map_outcome(
            &outcome,
            vec![
                (ModelRole::Primary, primary),
                (ModelRole::SecondaryA, secondary_a),
                (ModelRole::SecondaryB, secondary_b),
            ],
        );
        tracing::info!(
            label = %result.final_label,
            confidence = result.confidence_percent,
            "diagnosis ready"
        );
        Ok(result)
    }

    /// Classifies every row in parallel. Failures stay attached to their row.
    pub fn classify_batch(&self, rows: &mut [ImageInfo]) {
        rows.par_iter_mut().for_each(|info| {
            match self.classify(info.file.as_path()) {
                Ok(result) => {
                    info.diagnosis = Some(result);
                    info.error = None;
                }
                Err(err) => {
                    tracing::warn!("classification failed for {}: {err}", info.file.display());
                    info.diagnosis = None;
                    info.error = Some(err.to_string());
                }
            }
        });
    }

    /// Runs the three models concurrently and waits for all of them.
    fn predict_all(
        &self,
        tensor: Arc<ImageTensor>,
        cancel: &CancellationToken,
    ) -> Result<[ProbabilityVector; 3], ClassificationError> {
        let (tx, rx) = mpsc::channel();
        for role in ModelRole::ALL {
            let model = Arc::clone(self.classifiers.get(role));
            let tensor = Arc::clone(&tensor);
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("predict-{role}"))
                .spawn(move || {
                    let out = model.predict(&tensor);
                    // receiver is gone when the request was abandoned
                    let _ = tx.send((role, out));
                });
            if let Err(e) = spawned {
                return Err(ClassificationError::Inference {
                    role,
                    source: InferenceError::Backend(format!("failed to start worker: {e}")),
                });
            }
        }
        drop(tx);

        let started = Instant::now();
        let mut slots: [Option<ProbabilityVector>; 3] = [None, None, None];
        loop {
            if let [Some(p), Some(a), Some(b)] = slots {
                return Ok([p, a, b]);
            }
            if cancel.is_cancelled() {
                tracing::debug!("request cancelled, abandoning in-flight predictions");
                return Err(ClassificationError::Cancelled);
            }
            match rx.recv_timeout(CANCEL_POLL) {
                Ok((role, Ok(probs))) => slots[role.index()] = Some(probs),
                Ok((role, Err(source))) => {
                    return Err(ClassificationError::Inference { role, source });
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(limit) = self.timeout
                        && started.elapsed() >= limit
                    {
                        let role = first_missing(&slots);
                        tracing::warn!(%role, "classifier timed out after {limit:?}");
                        return Err(ClassificationError::Inference {
                            role,
                            source: InferenceError::Timeout(limit),
                        });
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClassificationError::Inference {
                        role: first_missing(&slots),
                        source: InferenceError::Backend("worker exited without a result".into()),
                    });
                }
            }
        }
    }
}

fn first_missing(slots: &[Option<ProbabilityVector>; 3]) -> ModelRole {
    ModelRole::ALL
        .into_iter()
        .find(|role| slots[role.index()].is_none())
        .unwrap_or(ModelRole::Primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::DiagnosticClass;
    use crate::classifier::Classifier;
    use crate::error::Stage;
    use crate::preprocess::RawPixels;

    struct Fixed(&'static str, [f32; 3]);

    impl Classifier for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn predict(&self, _: &ImageTensor) -> Result<ProbabilityVector, InferenceError> {
            ProbabilityVector::new(&self.1)
        }
    }

    struct Slow(Duration);

    impl Classifier for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn predict(&self, _: &ImageTensor) -> Result<ProbabilityVector, InferenceError> {
            thread::sleep(self.0);
            ProbabilityVector::new(&[1.0, 0.0, 0.0])
        }
    }

    fn gray() -> RawPixels {
        RawPixels {
            width: 8,
            height: 8,
            channels: 3,
            data: vec![90; 8 * 8 * 3],
        }
    }

    fn set(p: Arc<dyn Classifier>) -> ClassifierSet {
        ClassifierSet::new(
            p,
            Arc::new(Fixed("a", [0.1, 0.8, 0.1])),
            Arc::new(Fixed("b", [0.2, 0.2, 0.6])),
        )
    }

    #[test]
    fn slow_classifier_times_out() {
        let engine = DiagnosisEngine::new(set(Arc::new(Slow(Duration::from_secs(5)))))
            .with_timeout(Some(Duration::from_millis(50)));
        match engine.classify(gray()) {
            Err(ClassificationError::Inference {
                role: ModelRole::Primary,
                source: InferenceError::Timeout(_),
            }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_yields_no_result() {
        let engine = DiagnosisEngine::new(set(Arc::new(Slow(Duration::from_millis(500)))));
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                token.cancel();
            })
        };
        let err = engine.classify_with_cancel(gray(), &token).unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err.stage(), Stage::Cancelled);
    }

    struct Crashing;

    impl Classifier for Crashing {
        fn name(&self) -> &str {
            "crashing"
        }

        fn predict(&self, _: &ImageTensor) -> Result<ProbabilityVector, InferenceError> {
            panic!("model runtime aborted");
        }
    }

    #[test]
    fn panicking_worker_is_a_backend_error() {
        let engine = DiagnosisEngine::new(ClassifierSet::new(
            Arc::new(Fixed("p", [0.6, 0.2, 0.2])),
            Arc::new(Crashing),
            Arc::new(Fixed("b", [0.2, 0.2, 0.6])),
        ));
        match engine.classify(gray()) {
            Err(ClassificationError::Inference {
                role: ModelRole::SecondaryA,
                source: InferenceError::Backend(_),
            }) => {}
            other => panic!("expected backend error from secondary-A, got {other:?}"),
        }
    }

    #[test]
    fn tracker_cancels_superseded_request() {
        let tracker = RequestTracker::new();
        let first = tracker.begin();
        assert!(!first.is_cancelled());
        let second = tracker.begin();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn batch_keeps_failures_on_their_row() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        image::RgbImage::from_pixel(16, 16, image::Rgb([200, 40, 40]))
            .save(&good)
            .unwrap();
        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"not a jpeg").unwrap();

        let engine = DiagnosisEngine::new(set(Arc::new(Fixed("p", [0.05, 0.05, 0.9]))));
        let mut rows = vec![ImageInfo::new(good), ImageInfo::new(bad)];
        engine.classify_batch(&mut rows);

        let diagnosis = rows[0].diagnosis.as_ref().unwrap();
        assert_eq!(diagnosis.final_label, DiagnosticClass::Rop);
        assert!(rows[0].error.is_none());
        assert!(rows[1].diagnosis.is_none());
        assert!(rows[1].error.as_deref().unwrap().contains("decodable"));
    }
}
