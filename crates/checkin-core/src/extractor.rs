//! Bulk embedding extraction over an indexed dataset.
//!
//! Decoding and resizing run on a bounded rayon pool; the embedding model
//! itself is driven from the calling thread because ONNX sessions need
//! exclusive access. Files that fail to decode, or in which the model finds
//! no face, are skipped and reported rather than aborting the batch.

use crate::dataset::DatasetImage;
use crate::preprocess::load_prepared;
use crate::recognizer::EmbeddingModel;
use crate::types::Embedding;
use image::RgbImage;
use rayon::prelude::*;
use std::path::PathBuf;
use thiserror::Error;

/// Images decoded per parallel round, per worker.
const IMAGES_PER_WORKER: usize = 8;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no valid images found ({skipped} skipped)")]
    Empty { skipped: usize },
    #[error("embedding model returned {got} values, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// A file left out of the batch and why.
#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

/// Parallel arrays of embeddings and their integer labels.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFeatures {
    pub embeddings: Vec<Embedding>,
    pub labels: Vec<usize>,
    pub skipped: Vec<SkippedImage>,
}

impl ExtractedFeatures {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Drives image preparation and embedding for a batch of dataset images.
pub struct FeatureExtractor {
    pool: rayon::ThreadPool,
    input_size: u32,
}

impl FeatureExtractor {
    pub fn new(workers: usize, input_size: u32) -> Result<Self, ExtractError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("checkin-io-{i}"))
            .build()?;
        Ok(Self { pool, input_size })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Embed every image. Fails only when nothing usable remains or the model
    /// breaks its dimension contract.
    pub fn extract(
        &self,
        images: &[DatasetImage],
        model: &mut dyn EmbeddingModel,
    ) -> Result<ExtractedFeatures, ExtractError> {
        let expected = model.embedding_dim();
        let mut out = ExtractedFeatures::default();
        let round = self.workers() * IMAGES_PER_WORKER;

        for chunk in images.chunks(round.max(1)) {
            let size = self.input_size;
            let prepared: Vec<Result<RgbImage, image::ImageError>> = self
                .pool
                .install(|| chunk.par_iter().map(|img| load_prepared(&img.path, size)).collect());

            for (item, decoded) in chunk.iter().zip(prepared) {
                let image = match decoded {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::warn!(path = %item.path.display(), error = %e, "skipping unreadable image");
                        out.skipped.push(SkippedImage {
                            path: item.path.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                match model.embed(&image) {
                    Ok(embedding) => {
                        if embedding.dim() != expected {
                            return Err(ExtractError::DimensionMismatch {
                                expected,
                                got: embedding.dim(),
                            });
                        }
                        out.embeddings.push(embedding);
                        out.labels.push(item.label);
                    }
                    Err(e) => {
                        tracing::warn!(path = %item.path.display(), error = %e, "skipping image");
                        out.skipped.push(SkippedImage {
                            path: item.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if out.is_empty() {
            return Err(ExtractError::Empty {
                skipped: out.skipped.len(),
            });
        }

        tracing::info!(
            extracted = out.len(),
            skipped = out.skipped.len(),
            "feature extraction complete"
        );
        Ok(out)
    }
}
