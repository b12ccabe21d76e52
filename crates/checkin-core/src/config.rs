use crate::trainer::{EarlyStop, Hyperparameters};
use crate::verify::{DistanceMetric, DEFAULT_EUCLIDEAN_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_ENV: &str = "CHECKIN_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What identification does when the embedding model finds no face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoFacePolicy {
    /// Propagate `NoFaceDetected` to the caller.
    #[default]
    Fail,
    /// Report the person as [`UNKNOWN_PERSON`](crate::pipeline::UNKNOWN_PERSON).
    Unknown,
}

impl FromStr for NoFacePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(NoFacePolicy::Fail),
            "unknown" => Ok(NoFacePolicy::Unknown),
            other => Err(format!("unknown no-face policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub hidden_dim: usize,
    pub seed: u64,
    /// Stop after this many epochs without a `min_loss_delta` improvement.
    pub early_stop_patience: Option<usize>,
    pub min_loss_delta: f32,
    pub stop_at_perfect_accuracy: bool,
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let hp = Hyperparameters::default();
        Self {
            epochs: hp.epochs,
            learning_rate: hp.learning_rate,
            momentum: hp.momentum,
            hidden_dim: crate::classifier::DEFAULT_HIDDEN_DIM,
            seed: 42,
            early_stop_patience: None,
            min_loss_delta: 1e-4,
            stop_at_perfect_accuracy: false,
            log_interval: hp.log_interval,
        }
    }
}

impl TrainingConfig {
    pub fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters {
            epochs: self.epochs,
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            early_stop: self.early_stop_patience.map(|patience| EarlyStop {
                patience,
                min_delta: self.min_loss_delta,
            }),
            stop_at_perfect_accuracy: self.stop_at_perfect_accuracy,
            log_interval: self.log_interval,
        }
    }
}

/// Pipeline configuration: TOML file, then `CHECKIN_*` environment
/// variables, then whatever the caller overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub dataset_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub artifact_dir: Option<PathBuf>,
    /// Directory used as the blob-store bucket. Sync is off when unset.
    pub blob_dir: Option<PathBuf>,
    /// Square side images are resized to before embedding.
    pub input_size: u32,
    /// Image decode workers.
    pub workers: usize,
    pub distance_metric: DistanceMetric,
    pub verify_threshold: f32,
    pub no_face_policy: NoFacePolicy,
    pub person_confidence: f32,
    /// Pixels added on every side of a person box before cropping.
    pub person_padding: u32,
    pub training: TrainingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dataset_dir: None,
            model_dir: None,
            artifact_dir: None,
            blob_dir: None,
            input_size: 112,
            workers: 4,
            distance_metric: DistanceMetric::Euclidean,
            verify_threshold: DEFAULT_EUCLIDEAN_THRESHOLD,
            no_face_policy: NoFacePolicy::Fail,
            person_confidence: 0.5,
            person_padding: 100,
            training: TrainingConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("checkin")
}

impl Config {
    /// Load from `$CHECKIN_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `CHECKIN_*` variables provided by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        if let Some(p) = path("CHECKIN_DATA_DIR") {
            self.data_dir = p;
        }
        if let Some(p) = path("CHECKIN_DATASET_DIR") {
            self.dataset_dir = Some(p);
        }
        if let Some(p) = path("CHECKIN_MODEL_DIR") {
            self.model_dir = Some(p);
        }
        if let Some(p) = path("CHECKIN_ARTIFACT_DIR") {
            self.artifact_dir = Some(p);
        }
        if let Some(p) = path("CHECKIN_BLOB_DIR") {
            self.blob_dir = Some(p);
        }

        env_parse(&lookup, "CHECKIN_INPUT_SIZE", &mut self.input_size)?;
        env_parse(&lookup, "CHECKIN_WORKERS", &mut self.workers)?;
        env_parse(&lookup, "CHECKIN_DISTANCE_METRIC", &mut self.distance_metric)?;
        env_parse(&lookup, "CHECKIN_VERIFY_THRESHOLD", &mut self.verify_threshold)?;
        env_parse(&lookup, "CHECKIN_NO_FACE_POLICY", &mut self.no_face_policy)?;
        env_parse(&lookup, "CHECKIN_PERSON_CONFIDENCE", &mut self.person_confidence)?;
        env_parse(&lookup, "CHECKIN_PERSON_PADDING", &mut self.person_padding)?;
        env_parse(&lookup, "CHECKIN_EPOCHS", &mut self.training.epochs)?;
        env_parse(&lookup, "CHECKIN_LEARNING_RATE", &mut self.training.learning_rate)?;
        env_parse(&lookup, "CHECKIN_MOMENTUM", &mut self.training.momentum)?;
        env_parse(&lookup, "CHECKIN_SEED", &mut self.training.seed)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.workers == 0 {
            return fail("workers must be at least 1");
        }
        if self.input_size == 0 {
            return fail("input_size must be positive");
        }
        if !(self.verify_threshold.is_finite() && self.verify_threshold > 0.0) {
            return fail("verify_threshold must be positive");
        }
        if !(self.person_confidence > 0.0 && self.person_confidence <= 1.0) {
            return fail("person_confidence must be in (0, 1]");
        }
        if self.training.hidden_dim == 0 {
            return fail("training.hidden_dim must be positive");
        }
        self.training
            .hyperparameters()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.dataset_dir.clone().unwrap_or_else(|| self.data_dir.join("dataset"))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| self.data_dir.join("models"))
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(|| self.data_dir.join("artifacts"))
    }

    /// SCRFD face detector.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir().join("det_10g.onnx")
    }

    /// ArcFace embedding network.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir().join("w600k_r50.onnx")
    }

    /// YOLOv8 person detector.
    pub fn person_model_path(&self) -> PathBuf {
        self.model_dir().join("yolov8n.onnx")
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.artifact_dir().join("classifier.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.artifact_dir().join("training_metrics.json")
    }

    pub fn verification_log_path(&self) -> PathBuf {
        self.artifact_dir().join("verification.json")
    }
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = lookup(key) else { return Ok(()) };
    if raw.trim().is_empty() {
        return Ok(());
    }
    *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.clone(),
    })?;
    Ok(())
}
