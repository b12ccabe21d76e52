//! Identify / train / verify orchestration.
//!
//! [`CheckinPipeline`] owns every piece of mutable model state: the dataset
//! label map, extracted features, the classifier head and the verification
//! log. It takes `&mut self` for anything that touches the embedding model
//! or the head, so concurrent callers must serialize through a single owner
//! (the daemon's engine thread does exactly that).

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::classifier::{ClassifierError, ClassifierHead};
use crate::config::{Config, NoFacePolicy};
use crate::dataset::{self, index_images, validate_person_name, LabelMap};
use crate::error::PipelineError;
use crate::extractor::{ExtractedFeatures, FeatureExtractor};
use crate::person::{PersonDetector, YoloPersonDetector};
use crate::preprocess::{load_prepared, load_rgb, resize_square};
use crate::recognizer::{EmbeddingModel, OnnxEmbedder, RecognizerError};
use crate::store::{join_key, BlobStore, LocalBlobStore};
use crate::trainer::{evaluate, Hyperparameters, Trainer, TrainingReport, TrainingSet};
use crate::types::{BoundingBox, Embedding};
use crate::verify::{VerificationLog, VerificationResult, Verifier};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Name reported when the no-face policy is [`NoFacePolicy::Unknown`].
pub const UNKNOWN_PERSON: &str = "Unknown";

/// Blob-store prefix mirroring the dataset directory.
pub const DATASET_PREFIX: &str = "dataset/";
/// Blob-store prefix for trained artifacts.
pub const ARTIFACT_PREFIX: &str = "artifacts/";

/// Lifecycle of the classifier head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadState {
    Uninitialized,
    /// Architecture built for the current class count, not yet fit.
    Initialized,
    Trained,
    /// Trained and written to the checkpoint path.
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub person: String,
    /// `None` when the person is [`UNKNOWN_PERSON`].
    pub label: Option<usize>,
    pub confidence: f32,
}

impl Identification {
    fn unknown() -> Self {
        Self {
            person: UNKNOWN_PERSON.to_string(),
            label: None,
            confidence: 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.label.is_none()
    }
}

/// One person found in an uploaded photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonMatch {
    pub bbox: BoundingBox,
    /// Person-detector confidence.
    pub confidence: f32,
    pub person_name: String,
    /// Classifier confidence for `person_name`.
    pub match_confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetVerification {
    pub pairs: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Images (references included) that could not be embedded.
    pub skipped: usize,
    /// Identities with fewer than two images.
    pub singletons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: HeadState,
    pub classes: usize,
    pub fingerprint: Option<String>,
    pub dataset_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub metric: crate::verify::DistanceMetric,
    pub threshold: f32,
    pub no_face_policy: NoFacePolicy,
    pub person_detector: bool,
    pub blob_store: bool,
    pub verification_records: usize,
    pub last_epoch: Option<crate::trainer::EpochMetrics>,
}

/// Head plus the label map it was trained against.
#[derive(Clone)]
struct TrainedModel {
    head: ClassifierHead,
    labels: LabelMap,
}

pub struct CheckinPipeline {
    config: Config,
    model: Box<dyn EmbeddingModel + Send>,
    persons: Option<Box<dyn PersonDetector + Send>>,
    extractor: FeatureExtractor,
    verifier: Verifier,
    log: VerificationLog,
    store: Option<Box<dyn BlobStore>>,
    dataset_labels: Option<LabelMap>,
    features: Option<ExtractedFeatures>,
    trained: Option<TrainedModel>,
    state: HeadState,
    last_report: Option<TrainingReport>,
}

impl CheckinPipeline {
    /// Pipeline around an arbitrary embedding model. A blob store is
    /// attached when `config.blob_dir` is set.
    pub fn new(config: Config, model: Box<dyn EmbeddingModel + Send>) -> Result<Self, PipelineError> {
        config.validate()?;
        let extractor = FeatureExtractor::new(config.workers, config.input_size)?;
        let verifier = Verifier::new(config.distance_metric, config.verify_threshold);

        let store: Option<Box<dyn BlobStore>> = match &config.blob_dir {
            Some(dir) => {
                let store = LocalBlobStore::new(dir);
                store.ensure_bucket()?;
                Some(Box::new(store))
            }
            None => None,
        };

        Ok(Self {
            log: VerificationLog::new(config.distance_metric),
            config,
            model,
            persons: None,
            extractor,
            verifier,
            store,
            dataset_labels: None,
            features: None,
            trained: None,
            state: HeadState::Uninitialized,
            last_report: None,
        })
    }

    /// Production pipeline: SCRFD + ArcFace, YOLO person detection when its
    /// model file is present, and the saved checkpoint when one exists.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let embedder = OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())?;
        let person_model = config.person_model_path();
        let mut pipeline = Self::new(config, Box::new(embedder))?;

        if person_model.exists() {
            let detector = YoloPersonDetector::load(&person_model, pipeline.config.person_confidence)?;
            pipeline.persons = Some(Box::new(detector));
        } else {
            tracing::warn!(path = %person_model.display(), "person detector model missing; photo processing disabled");
        }

        match pipeline.load() {
            Ok(_) => {}
            Err(PipelineError::Checkpoint(CheckpointError::NotFound(path))) => {
                tracing::info!(path = %path.display(), "no checkpoint yet; train before identifying");
            }
            Err(e) => return Err(e),
        }
        Ok(pipeline)
    }

    pub fn with_person_detector(mut self, detector: Box<dyn PersonDetector + Send>) -> Self {
        self.persons = Some(detector);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> HeadState {
        self.state
    }

    /// Label map of the loaded classifier.
    pub fn labels(&self) -> Option<&LabelMap> {
        self.trained.as_ref().map(|t| &t.labels)
    }

    pub fn features(&self) -> Option<&ExtractedFeatures> {
        self.features.as_ref()
    }

    pub fn last_report(&self) -> Option<&TrainingReport> {
        self.last_report.as_ref()
    }

    pub fn verification_log(&self) -> &VerificationLog {
        &self.log
    }

    // ---- dataset ----

    /// Scan the dataset directory, fetching it from the blob store first
    /// when it does not exist locally.
    pub fn build_label_map(&mut self) -> Result<&LabelMap, PipelineError> {
        let root = self.config.dataset_dir();
        if !root.exists() {
            if let Some(store) = &self.store {
                tracing::warn!(dir = %root.display(), "dataset missing locally; fetching from blob store");
                store.fetch_prefix(DATASET_PREFIX, &root)?;
            }
        }

        let labels = LabelMap::scan(&root)?;
        tracing::info!(dir = %root.display(), identities = labels.len(), "label map built");
        self.features = None;
        Ok(self.dataset_labels.insert(labels))
    }

    /// Embed every dataset image under the current label map.
    pub fn extract(&mut self) -> Result<&ExtractedFeatures, PipelineError> {
        if self.dataset_labels.is_none() {
            self.build_label_map()?;
        }
        let Some(labels) = &self.dataset_labels else {
            return Err(PipelineError::NoFeatures);
        };
        let images = index_images(&self.config.dataset_dir(), labels)?;
        let features = self.extractor.extract(&images, &mut *self.model)?;
        Ok(self.features.insert(features))
    }

    // ---- training ----

    /// Fit the classifier head on the extracted features and persist it.
    ///
    /// With `continue_training`, the current head (or the saved checkpoint)
    /// is reused and its output rows are remapped by person name onto the
    /// current label map. The loaded classifier keeps serving until the new
    /// one has been fit.
    pub fn train(
        &mut self,
        hyper: Hyperparameters,
        continue_training: bool,
    ) -> Result<TrainingReport, PipelineError> {
        let (Some(features), Some(labels)) = (&self.features, &self.dataset_labels) else {
            return Err(PipelineError::NoFeatures);
        };
        let data = TrainingSet::new(&features.embeddings, &features.labels)?;
        let labels = labels.clone();
        let trainer = Trainer::new(hyper)?;
        let mut rng = StdRng::seed_from_u64(self.config.training.seed);

        let mut head = match self.resume_head(continue_training, data.dim())? {
            Some(mut previous) => {
                previous.head.remap_output(&previous.labels, &labels, &mut rng)?;
                let accuracy = evaluate(&previous.head, &data)?;
                tracing::info!(
                    previous = previous.labels.len(),
                    classes = labels.len(),
                    accuracy,
                    "continuing from existing classifier"
                );
                previous.head
            }
            None => ClassifierHead::new(data.dim(), self.config.training.hidden_dim, labels.len(), &mut rng)?,
        };
        if self.trained.is_none() {
            self.state = HeadState::Initialized;
        }

        let report = trainer.train(&mut head, &data)?;
        self.trained = Some(TrainedModel {
            head,
            labels: labels.clone(),
        });
        self.state = HeadState::Trained;
        self.last_report = Some(report.clone());

        self.persist(&report)?;
        Ok(report)
    }

    /// Label map, extraction and training in one go, with hyperparameters
    /// from the config overridden by `overrides`.
    pub fn train_from_dataset(
        &mut self,
        overrides: &std::collections::HashMap<String, String>,
        continue_training: bool,
    ) -> Result<TrainingReport, PipelineError> {
        let hyper = self.config.training.hyperparameters().with_overrides(overrides)?;
        self.build_label_map()?;
        self.extract()?;
        self.train(hyper, continue_training)
    }

    fn resume_head(&self, continue_training: bool, dim: usize) -> Result<Option<TrainedModel>, PipelineError> {
        if !continue_training {
            return Ok(None);
        }
        let previous = match &self.trained {
            Some(t) => t.clone(),
            None => match Checkpoint::load(&self.config.classifier_path()) {
                Ok(ckpt) => {
                    let (head, labels, _) = ckpt.into_parts()?;
                    TrainedModel { head, labels }
                }
                Err(CheckpointError::NotFound(_)) => {
                    tracing::info!("no previous classifier; training from scratch");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
        };
        if previous.head.input_dim() != dim {
            tracing::warn!(
                expected = dim,
                found = previous.head.input_dim(),
                "previous classifier has a different input size; training from scratch"
            );
            return Ok(None);
        }
        Ok(Some(previous))
    }

    fn persist(&mut self, report: &TrainingReport) -> Result<(), PipelineError> {
        let Some(trained) = &self.trained else {
            return Err(PipelineError::NotTrained);
        };
        let path = self.config.classifier_path();
        Checkpoint::new(&trained.head, &trained.labels, Some(report.clone())).save(&path)?;

        let metrics = self.config.metrics_path();
        let json = serde_json::to_vec_pretty(report).map_err(|e| PipelineError::Io {
            path: metrics.clone(),
            source: std::io::Error::other(e),
        })?;
        std::fs::write(&metrics, json).map_err(|source| PipelineError::Io {
            path: metrics.clone(),
            source,
        })?;
        self.state = HeadState::Persisted;

        if let Some(store) = &self.store {
            for file in [&path, &metrics] {
                if let Some(name) = file.file_name() {
                    store.put_file(&join_key(ARTIFACT_PREFIX, Path::new(name)), file)?;
                }
            }
        }
        Ok(())
    }

    /// Restore the classifier and its label map from the checkpoint.
    pub fn load(&mut self) -> Result<&LabelMap, PipelineError> {
        let ckpt = Checkpoint::load(&self.config.classifier_path())?;
        let (head, labels, report) = ckpt.into_parts()?;
        tracing::info!(classes = labels.len(), "classifier loaded");
        self.last_report = report;
        self.state = HeadState::Persisted;
        let trained = self.trained.insert(TrainedModel { head, labels });
        Ok(&trained.labels)
    }

    // ---- inference ----

    /// Identify the person in an image file (normally a person crop).
    pub fn identify(&mut self, path: &Path) -> Result<Identification, PipelineError> {
        if self.trained.is_none() {
            return Err(PipelineError::NotTrained);
        }
        let image = load_rgb(path).map_err(|source| PipelineError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        self.identify_image(&image)
    }

    /// Identify the person in an in-memory image, applying the no-face policy.
    pub fn identify_image(&mut self, image: &RgbImage) -> Result<Identification, PipelineError> {
        if self.trained.is_none() {
            return Err(PipelineError::NotTrained);
        }
        let prepared = resize_square(image, self.config.input_size);
        let embedding = match self.model.embed(&prepared) {
            Ok(e) => e,
            Err(RecognizerError::NoFaceDetected) if self.config.no_face_policy == NoFacePolicy::Unknown => {
                tracing::info!("no face in crop; reporting unknown");
                return Ok(Identification::unknown());
            }
            Err(e) => return Err(e.into()),
        };

        let trained = self.trained.as_ref().ok_or(PipelineError::NotTrained)?;
        let prediction = trained.head.predict(&embedding.values)?;
        let person = trained
            .labels
            .name(prediction.label)
            .ok_or_else(|| ClassifierError::LabelOutOfRange {
                label: prediction.label,
                classes: trained.labels.len(),
            })?
            .to_string();

        tracing::debug!(%person, confidence = prediction.confidence, "identified");
        Ok(Identification {
            person,
            label: Some(prediction.label),
            confidence: prediction.confidence,
        })
    }

    /// Detect people in a photo, crop each with padding and identify it.
    pub fn process_photo(&mut self, path: &Path) -> Result<Vec<PersonMatch>, PipelineError> {
        let photo = load_rgb(path).map_err(|source| PipelineError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        self.process_image(&photo)
    }

    pub fn process_image(&mut self, photo: &RgbImage) -> Result<Vec<PersonMatch>, PipelineError> {
        if self.trained.is_none() {
            return Err(PipelineError::NotTrained);
        }
        let detector = self.persons.as_mut().ok_or(PipelineError::NoPersonDetector)?;
        let detections = detector.detect(photo)?;
        tracing::info!(people = detections.len(), "person detection");

        let mut matches = Vec::with_capacity(detections.len());
        for det in detections {
            let Some(crop) = det.crop(photo, self.config.person_padding) else {
                tracing::debug!(bbox = ?det.bbox, "detection outside photo; skipped");
                continue;
            };
            let id = self.identify_image(&crop)?;
            matches.push(PersonMatch {
                confidence: det.confidence(),
                bbox: det.bbox,
                person_name: id.person,
                match_confidence: id.confidence,
            });
        }
        Ok(matches)
    }

    // ---- verification ----

    fn embed_file(&mut self, path: &Path) -> Result<Embedding, PipelineError> {
        let image = load_prepared(path, self.config.input_size).map_err(|source| PipelineError::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.model.embed(&image)?)
    }

    /// Compare two image files; the result is appended to the log.
    pub fn verify(&mut self, a: &Path, b: &Path) -> Result<VerificationResult, PipelineError> {
        let ea = self.embed_file(a)?;
        let eb = self.embed_file(b)?;
        let result = self.verifier.compare(&ea, &eb);
        tracing::info!(
            distance = result.distance,
            same_person = result.same_person,
            "verified pair"
        );
        self.log.push(a, b, result);
        Ok(result)
    }

    /// Compare an image against the reference photo of an enrolled person
    /// (the first of their images in sorted order).
    pub fn verify_person(&mut self, image: &Path, person: &str) -> Result<VerificationResult, PipelineError> {
        validate_person_name(person)?;
        let dir = self.config.dataset_dir().join(person);
        if !dir.is_dir() {
            return Err(PipelineError::UnknownPerson(person.to_string()));
        }
        let reference = dataset::identity_images(&dir)?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::NoReference(person.to_string()))?;
        self.verify(&reference, image)
    }

    /// Verify every image of every identity against that identity's
    /// reference image. The log is reset first, so it holds this run only.
    pub fn verify_dataset(&mut self) -> Result<DatasetVerification, PipelineError> {
        let root = self.config.dataset_dir();
        let labels = LabelMap::scan(&root)?;
        let mut summary = DatasetVerification::default();
        self.log.clear();

        for (_, name) in labels.iter() {
            let images = dataset::identity_images(&root.join(name))?;
            let Some((reference, rest)) = images.split_first() else {
                summary.singletons.push(name.to_string());
                continue;
            };
            if rest.is_empty() {
                summary.singletons.push(name.to_string());
                continue;
            }
            let reference_embedding = match self.embed_file(reference) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(person = name, path = %reference.display(), error = %e, "reference unusable; identity skipped");
                    summary.skipped += 1 + rest.len();
                    continue;
                }
            };
            for candidate in rest {
                let embedding = match self.embed_file(candidate) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(path = %candidate.display(), error = %e, "skipping image");
                        summary.skipped += 1;
                        continue;
                    }
                };
                let result = self.verifier.compare(&reference_embedding, &embedding);
                self.log.push(reference, candidate, result);
                summary.pairs += 1;
                if result.same_person {
                    summary.accepted += 1;
                } else {
                    summary.rejected += 1;
                }
            }
        }

        tracing::info!(
            pairs = summary.pairs,
            accepted = summary.accepted,
            rejected = summary.rejected,
            skipped = summary.skipped,
            "dataset verification finished"
        );
        Ok(summary)
    }

    /// Write the verification log to the artifact directory and empty it.
    pub fn save_verification_log(&mut self) -> Result<PathBuf, PipelineError> {
        let path = self.config.verification_log_path();
        self.log.write_json(&path).map_err(|source| PipelineError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(records = self.log.len(), path = %path.display(), "verification log saved");
        self.log.clear();
        Ok(path)
    }

    // ---- enrollment ----

    /// Store a new photo for `person` and mirror it to the blob store.
    /// Does not retrain.
    pub fn enroll(&mut self, image: &RgbImage, person: &str) -> Result<PathBuf, PipelineError> {
        validate_person_name(person)?;
        let dir = self.config.dataset_dir().join(person);
        std::fs::create_dir_all(&dir).map_err(|source| PipelineError::Io {
            path: dir.clone(),
            source,
        })?;

        let file_name = format!("{person}_{}.png", uuid::Uuid::new_v4());
        let path = dir.join(&file_name);
        image.save(&path).map_err(|source| PipelineError::Image {
            path: path.clone(),
            source,
        })?;

        if let Some(store) = &self.store {
            let key = join_key(DATASET_PREFIX, &Path::new(person).join(&file_name));
            store.put_file(&key, &path)?;
        }
        tracing::info!(person, path = %path.display(), "photo enrolled");
        Ok(path)
    }

    pub fn enroll_file(&mut self, source: &Path, person: &str) -> Result<PathBuf, PipelineError> {
        let image = load_rgb(source).map_err(|e| PipelineError::Image {
            path: source.to_path_buf(),
            source: e,
        })?;
        self.enroll(&image, person)
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state,
            classes: self.labels().map_or(0, LabelMap::len),
            fingerprint: self.labels().map(LabelMap::fingerprint),
            dataset_dir: self.config.dataset_dir(),
            checkpoint: self.config.classifier_path(),
            metric: self.verifier.metric(),
            threshold: self.verifier.threshold(),
            no_face_policy: self.config.no_face_policy,
            person_detector: self.persons.is_some(),
            blob_store: self.store.is_some(),
            verification_records: self.log.len(),
            last_epoch: self.last_report.as_ref().and_then(|r| r.last().copied()),
        }
    }
}
