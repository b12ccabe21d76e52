//! On-disk classifier checkpoint.
//!
//! The label map travels with the weights so that inference never depends on
//! the live dataset directory. A SHA-256 fingerprint of the ordered names
//! guards against hand-edited or truncated files.

use crate::classifier::{ClassifierHead, Linear};
use crate::dataset::{DatasetError, LabelMap};
use crate::trainer::TrainingReport;
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checkpoint: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported checkpoint version {found} (expected {CHECKPOINT_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("label fingerprint mismatch: stored {stored}, computed {computed}")]
    FingerprintMismatch { stored: String, computed: String },
    #[error("layer shape mismatch: {0}")]
    Shape(String),
    #[error(transparent)]
    Labels(#[from] DatasetError),
}

/// Row-major weights of one affine layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerState {
    pub rows: usize,
    pub cols: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LayerState {
    pub fn from_linear(layer: &Linear) -> Self {
        Self {
            rows: layer.output_dim(),
            cols: layer.input_dim(),
            weight: layer.weight.iter().copied().collect(),
            bias: layer.bias.to_vec(),
        }
    }

    pub fn into_linear(self) -> Result<Linear, CheckpointError> {
        if self.bias.len() != self.rows {
            return Err(CheckpointError::Shape(format!(
                "bias has {} entries for {} rows",
                self.bias.len(),
                self.rows
            )));
        }
        let weight = Array2::from_shape_vec((self.rows, self.cols), self.weight).map_err(|e| {
            CheckpointError::Shape(format!("weight is not {}x{}: {e}", self.rows, self.cols))
        })?;
        Ok(Linear {
            weight,
            bias: Array1::from(self.bias),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub labels: LabelMap,
    pub fingerprint: String,
    pub fc1: LayerState,
    pub fc2: LayerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<TrainingReport>,
}

impl Checkpoint {
    pub fn new(head: &ClassifierHead, labels: &LabelMap, report: Option<TrainingReport>) -> Self {
        let (fc1, fc2) = head.layers();
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            input_dim: head.input_dim(),
            hidden_dim: head.hidden_dim(),
            labels: labels.clone(),
            fingerprint: labels.fingerprint(),
            fc1: LayerState::from_linear(fc1),
            fc2: LayerState::from_linear(fc2),
            report,
        }
    }

    /// Write to `path` via a sibling temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let io = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io)?;
        std::fs::rename(&tmp, path).map_err(io)?;

        tracing::info!(
            path = %path.display(),
            classes = self.labels.len(),
            fingerprint = %self.fingerprint,
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        if !path.exists() {
            return Err(CheckpointError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        checkpoint.check()?;
        tracing::debug!(path = %path.display(), classes = checkpoint.labels.len(), "checkpoint loaded");
        Ok(checkpoint)
    }

    fn check(&self) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion { found: self.version });
        }
        // Deserialization bypasses the uniqueness check.
        LabelMap::new(self.labels.names().to_vec())?;

        let computed = self.labels.fingerprint();
        if computed != self.fingerprint {
            return Err(CheckpointError::FingerprintMismatch {
                stored: self.fingerprint.clone(),
                computed,
            });
        }
        if self.fc1.cols != self.input_dim || self.fc1.rows != self.hidden_dim {
            return Err(CheckpointError::Shape(format!(
                "fc1 is {}x{}, header says {}x{}",
                self.fc1.rows, self.fc1.cols, self.hidden_dim, self.input_dim
            )));
        }
        if self.fc2.cols != self.hidden_dim || self.fc2.rows != self.labels.len() {
            return Err(CheckpointError::Shape(format!(
                "fc2 is {}x{} for {} labels",
                self.fc2.rows,
                self.fc2.cols,
                self.labels.len()
            )));
        }
        Ok(())
    }

    /// Rebuild the head; the label map and report come along unchanged.
    pub fn into_parts(self) -> Result<(ClassifierHead, LabelMap, Option<TrainingReport>), CheckpointError> {
        let fc1 = self.fc1.into_linear()?;
        let fc2 = self.fc2.into_linear()?;
        let head = ClassifierHead::from_layers(fc1, fc2)
            .map_err(|e| CheckpointError::Shape(e.to_string()))?;
        Ok((head, self.labels, self.report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn labels(names: &[&str]) -> LabelMap {
        LabelMap::new(names.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    fn head(classes: usize) -> ClassifierHead {
        ClassifierHead::new(8, 4, classes, &mut StdRng::seed_from_u64(5)).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("artifacts/classifier.json");
        let map = labels(&["alice", "bob"]);
        let saved_head = head(2);

        Checkpoint::new(&saved_head, &map, None).save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let (restored, restored_map, report) = Checkpoint::load(&path).unwrap().into_parts().unwrap();
        assert_eq!(restored_map, map);
        assert!(report.is_none());
        assert_eq!(restored.layers().0.weight, saved_head.layers().0.weight);
        assert_eq!(restored.layers().1.bias, saved_head.layers().1.bias);
    }

    #[test]
    fn test_tampered_labels_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("classifier.json");
        Checkpoint::new(&head(2), &labels(&["alice", "bob"]), None).save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap().replace("\"bob\"", "\"eve\"");
        std::fs::write(&path, text).unwrap();

        assert!(matches!(
            Checkpoint::load(&path),
            Err(CheckpointError::FingerprintMismatch { .. })
        ));
    }

    #[test]
    fn test_output_width_must_match_labels() {
        let mut ckpt = Checkpoint::new(&head(3), &labels(&["a", "b", "c"]), None);
        ckpt.labels = labels(&["a", "b"]);
        ckpt.fingerprint = ckpt.labels.fingerprint();
        assert!(matches!(ckpt.check(), Err(CheckpointError::Shape(_))));
    }

    #[test]
    fn test_version_and_missing_file() {
        let mut ckpt = Checkpoint::new(&head(1), &labels(&["a"]), None);
        ckpt.version = 99;
        assert!(matches!(ckpt.check(), Err(CheckpointError::UnsupportedVersion { found: 99 })));
        assert!(matches!(
            Checkpoint::load(Path::new("/nonexistent/classifier.json")),
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[test]
    fn test_layer_state_shape_checks() {
        let bad = LayerState { rows: 2, cols: 2, weight: vec![0.0; 3], bias: vec![0.0; 2] };
        assert!(matches!(bad.into_linear(), Err(CheckpointError::Shape(_))));
        let bad_bias = LayerState { rows: 2, cols: 1, weight: vec![0.0; 2], bias: vec![0.0] };
        assert!(matches!(bad_bias.into_linear(), Err(CheckpointError::Shape(_))));
    }
}
