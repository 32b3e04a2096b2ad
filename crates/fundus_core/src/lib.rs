//! Ensemble diagnosis of fundus photographs.
//!
//! Three independently trained classifiers score the same preprocessed image;
//! their outputs are fused with a confidence-gated weighted rule and mapped to
//! one of Healthy, Retinal Detachment or ROP plus the indicator set a
//! presenter should enable.

use anyhow::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub mod class;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod labels;
#[cfg(feature = "ort")]
pub mod onnx;
pub mod preprocess;

pub use class::{DiagnosticClass, Indicator, ProbabilityVector};
pub use classifier::{Classifier, ClassifierSet, ModelRole};
pub use config::EngineConfig;
pub use engine::{CancellationToken, DiagnosisEngine, RequestTracker};
pub use error::{ClassificationError, InferenceError, PreprocessError, Stage};
pub use fusion::{EnsembleFusion, FusionOutcome, FusionPath, FusionWeights};
pub use labels::{DiagnosisResult, LabelMapper};
pub use preprocess::{ImagePreprocessor, ImageSource, ImageTensor, RawPixels};

/// One image in a batch run and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    pub file: PathBuf,
    pub diagnosis: Option<DiagnosisResult>,
    /// Why the image could not be classified, if it failed.
    pub error: Option<String>,
}

impl ImageInfo {
    pub fn new(file: PathBuf) -> Self {
        Self {
            file,
            diagnosis: None,
            error: None,
        }
    }
}

/// Options controlling how folder scanning behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// When true, scan subdirectories recursively.
    pub recursive: bool,
}

/// Scan a folder for fundus images.
pub fn scan_folder(path: impl AsRef<Path>) -> Result<Vec<ImageInfo>> {
    scan_folder_with(path, ScanOptions::default())
}

/// Scan a folder with options. Results are sorted by path.
pub fn scan_folder_with(path: impl AsRef<Path>, opts: ScanOptions) -> Result<Vec<ImageInfo>> {
    let root = path.as_ref();
    if !root.exists() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("Path is not a directory: {}", root.display());
    }

    let walker = if opts.recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };

    let mut infos = Vec::new();
    for entry in walker.sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("walkdir error: {}", e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && is_supported_image(path) {
            infos.push(ImageInfo::new(path.to_path_buf()));
        }
    }
    Ok(infos)
}

/// Export batch results to CSV with headers:
/// file,label,confidence,unhealthy,enabled,error
pub fn export_csv(rows: &[ImageInfo], path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["file", "label", "confidence", "unhealthy", "enabled", "error"])?;

    for info in rows {
        let (label, confidence, unhealthy, enabled) = match &info.diagnosis {
            Some(d) => (
                d.final_label.label().to_string(),
                format!("{:.1}", d.confidence_percent),
                d.is_unhealthy.to_string(),
                d.enabled_labels
                    .iter()
                    .map(|i| i.label())
                    .collect::<Vec<_>>()
                    .join(";"),
            ),
            None => Default::default(),
        };
        wtr.write_record([
            info.file.to_string_lossy().as_ref(),
            label.as_str(),
            confidence.as_str(),
            unhealthy.as_str(),
            enabled.as_str(),
            info.error.as_deref().unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

fn is_supported_image(path: &Path) -> bool {
    match path.extension().and_then(|s| s.to_str()) {
        Some(ext) => {
            let ext = ext.to_ascii_lowercase();
            matches!(ext.as_str(), "jpg" | "jpeg" | "png")
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn export_csv_writes_diagnoses_and_failures() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        let rop = LabelMapper.map_label(ProbabilityVector::new(&[0.1, 0.2, 0.7])?, 70.0);
        let rows = vec![
            ImageInfo {
                file: PathBuf::from("a.jpg"),
                diagnosis: Some(rop),
                error: None,
            },
            ImageInfo {
                file: PathBuf::from("b.png"),
                diagnosis: None,
                error: Some("not an image".into()),
            },
        ];

        export_csv(&rows, &path)?;

        let mut rdr = csv::Reader::from_path(&path)?;
        let headers = rdr.headers()?.clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["file", "label", "confidence", "unhealthy", "enabled", "error"]
        );

        let mut recs = rdr.records();
        let r1 = recs.next().unwrap()?;
        assert_eq!(&r1[0], "a.jpg");
        assert_eq!(&r1[1], "ROP");
        assert_eq!(&r1[2], "70.0");
        assert_eq!(&r1[3], "true");
        assert_eq!(&r1[4], "Unhealthy;ROP");
        assert_eq!(&r1[5], "");

        let r2 = recs.next().unwrap()?;
        assert_eq!(&r2[0], "b.png");
        assert_eq!(&r2[1], "");
        assert_eq!(&r2[5], "not an image");

        assert!(recs.next().is_none());
        Ok(())
    }

    #[test]
    fn scan_folder_empty_returns_empty() -> Result<()> {
        let dir = tempdir()?;
        let rows = scan_folder(dir.path())?;
        assert!(rows.is_empty());
        Ok(())
    }

    #[test]
    fn scan_folder_rejects_missing_path() {
        let dir = tempdir().unwrap();
        assert!(scan_folder(dir.path().join("nope")).is_err());
    }

    /// One screening session: two eyes, a follow-up in a visit subfolder,
    /// plus files that are not photographs.
    fn screening_session(root: &Path) -> Result<()> {
        File::create(root.join("OD_baby42.JPG"))?;
        File::create(root.join("OS_baby42.jpeg"))?;
        File::create(root.join("referral_letter.pdf"))?;
        File::create(root.join("camera_log"))?;
        let visit = root.join("visit_2");
        fs::create_dir(&visit)?;
        File::create(visit.join("OD_baby42_followup.png"))?;
        Ok(())
    }

    #[rstest::rstest]
    #[case(false, &["OD_baby42.JPG", "OS_baby42.jpeg"])]
    #[case(true, &["OD_baby42.JPG", "OS_baby42.jpeg", "OD_baby42_followup.png"])]
    fn scan_folder_finds_fundus_photos(
        #[case] recursive: bool,
        #[case] expected: &[&str],
    ) -> Result<()> {
        let dir = tempdir()?;
        screening_session(dir.path())?;

        let rows = scan_folder_with(dir.path(), ScanOptions { recursive })?;
        let found: Vec<String> = rows
            .iter()
            .filter_map(|i| i.file.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(found, expected);
        assert!(rows.iter().all(|i| i.diagnosis.is_none() && i.error.is_none()));
        Ok(())
    }
}
