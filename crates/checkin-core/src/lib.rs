//! checkin-core: face identification pipeline for contactless check-in.
//!
//! SCRFD finds faces, ArcFace embeds them (both via ONNX Runtime), and a
//! small trainable classifier head maps embeddings onto the enrolled roster.
//! Verification compares embeddings by distance instead of classifying.

pub mod alignment;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod person;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod store;
pub mod trainer;
pub mod types;
pub mod verify;

pub use config::{Config, NoFacePolicy};
pub use dataset::LabelMap;
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{CheckinPipeline, HeadState, Identification, PersonMatch, UNKNOWN_PERSON};
pub use recognizer::EmbeddingModel;
pub use trainer::{Hyperparameters, TrainingReport};
pub use types::{BoundingBox, Embedding};
pub use verify::{DistanceMetric, VerificationResult};
