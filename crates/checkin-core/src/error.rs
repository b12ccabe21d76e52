use crate::checkpoint::CheckpointError;
use crate::classifier::ClassifierError;
use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::detector::DetectorError;
use crate::extractor::ExtractError;
use crate::recognizer::RecognizerError;
use crate::store::StoreError;
use crate::trainer::TrainError;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing directories, model files or bad settings.
    Configuration,
    /// Bad images, names or request payloads.
    InvalidInput,
    /// Operation requested before the classifier is ready.
    ModelState,
    /// Face/person models and the blob store.
    ExternalDependency,
    /// Persisted state disagrees with itself or with the dataset.
    DataIntegrity,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error("person detector: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("blob store: {0}")]
    Store(#[from] StoreError),
    #[error("cannot open image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("classifier not loaded; train or load a checkpoint first")]
    NotTrained,
    #[error("no extracted features; run extraction before training")]
    NoFeatures,
    #[error("no person detector configured")]
    NoPersonDetector,
    #[error("unknown person {0:?}")]
    UnknownPerson(String),
    #[error("no reference image for {0:?}")]
    NoReference(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        use ErrorKind::*;
        match self {
            PipelineError::Config(_) => Configuration,
            PipelineError::Dataset(e) => match e {
                DatasetError::NotFound(_)
                | DatasetError::NotADirectory(_)
                | DatasetError::NoIdentities(_) => Configuration,
                DatasetError::DuplicateName(_) => DataIntegrity,
                DatasetError::InvalidPersonName(_) => InvalidInput,
                DatasetError::Io { .. } => ExternalDependency,
            },
            PipelineError::Extract(e) => match e {
                ExtractError::Empty { .. } => InvalidInput,
                ExtractError::DimensionMismatch { .. } => DataIntegrity,
                ExtractError::Pool(_) => Configuration,
            },
            PipelineError::Recognizer(RecognizerError::ModelNotFound(_))
            | PipelineError::Recognizer(RecognizerError::Detector(DetectorError::ModelNotFound(_)))
            | PipelineError::Detector(DetectorError::ModelNotFound(_)) => Configuration,
            PipelineError::Recognizer(_) | PipelineError::Detector(_) => ExternalDependency,
            PipelineError::Classifier(e) | PipelineError::Train(TrainError::Classifier(e)) => match e {
                ClassifierError::DimensionMismatch { .. } | ClassifierError::LabelOutOfRange { .. } => {
                    DataIntegrity
                }
                _ => InvalidInput,
            },
            PipelineError::Train(_) => InvalidInput,
            PipelineError::Checkpoint(e) => match e {
                CheckpointError::NotFound(_) => ModelState,
                CheckpointError::Io { .. } => ExternalDependency,
                _ => DataIntegrity,
            },
            PipelineError::Store(StoreError::InvalidKey(_)) => InvalidInput,
            PipelineError::Store(_) => ExternalDependency,
            PipelineError::Image { .. } => InvalidInput,
            PipelineError::Io { .. } => ExternalDependency,
            PipelineError::NotTrained | PipelineError::NoFeatures => ModelState,
            PipelineError::NoPersonDetector => Configuration,
            PipelineError::UnknownPerson(_) | PipelineError::NoReference(_) => InvalidInput,
        }
    }

    /// True for the one error the no-face policy may absorb.
    pub fn is_no_face(&self) -> bool {
        matches!(self, PipelineError::Recognizer(RecognizerError::NoFaceDetected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(PipelineError::NotTrained.kind(), ErrorKind::ModelState);
        assert_eq!(
            PipelineError::from(RecognizerError::NoFaceDetected).kind(),
            ErrorKind::ExternalDependency
        );
        assert_eq!(
            PipelineError::from(RecognizerError::ModelNotFound("x".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            PipelineError::from(DatasetError::NotFound(PathBuf::from("/x"))).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            PipelineError::from(TrainError::Classifier(ClassifierError::LabelOutOfRange {
                label: 3,
                classes: 2
            }))
            .kind(),
            ErrorKind::DataIntegrity
        );
        assert_eq!(
            PipelineError::from(CheckpointError::FingerprintMismatch {
                stored: "a".into(),
                computed: "b".into()
            })
            .kind(),
            ErrorKind::DataIntegrity
        );
        assert_eq!(
            PipelineError::from(ExtractError::Empty { skipped: 4 }).kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_only_no_face_is_absorbable() {
        assert!(PipelineError::from(RecognizerError::NoFaceDetected).is_no_face());
        assert!(!PipelineError::from(RecognizerError::InferenceFailed("x".into())).is_no_face());
        assert!(!PipelineError::NotTrained.is_no_face());
    }
}
