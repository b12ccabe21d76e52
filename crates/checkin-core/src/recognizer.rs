//! ArcFace face recognizer via ONNX Runtime.
//!
//! [`OnnxEmbedder`] is the production [`EmbeddingModel`]: SCRFD finds the
//! face inside a crop, the face is aligned to the ArcFace template, and the
//! w600k_r50 network turns it into a 512-dimensional vector.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detector::{DetectorError, FaceDetector};
use crate::preprocess::{resize_square, to_nchw, Normalization};
use crate::types::{BoundingBox, Embedding};
use image::imageops;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_NORM: Normalization = Normalization::SYMMETRIC;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a prepared RGB crop into a face embedding.
///
/// Implementations must return [`RecognizerError::NoFaceDetected`] when the
/// crop contains no face rather than inventing a vector.
pub trait EmbeddingModel {
    fn embed(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError>;

    fn embedding_dim(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

impl<T: EmbeddingModel + ?Sized> EmbeddingModel for Box<T> {
    fn embed(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError> {
        (**self).embed(image)
    }

    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }
}

/// ArcFace network over aligned 112×112 crops.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed an already aligned 112×112 face. The vector is returned as the
    /// network produced it (not L2-normalized).
    pub fn embed_aligned(&mut self, aligned: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = to_nchw(aligned, ARCFACE_NORM);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// SCRFD + alignment + ArcFace.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, RecognizerError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed(&mut self, image: &RgbImage) -> Result<Embedding, RecognizerError> {
        let faces = self.detector.detect(image)?;
        let face = faces.first().ok_or(RecognizerError::NoFaceDetected)?;
        tracing::trace!(confidence = face.confidence, faces = faces.len(), "face located");

        let aligned = face_crop(image, face);
        self.recognizer.embed_aligned(&aligned)
    }
}

/// Aligned crop when landmarks are available, otherwise the box resized.
fn face_crop(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    if let Some(landmarks) = &face.landmarks {
        return alignment::align_face(image, landmarks);
    }
    let (x0, y0, x1, y1) = face.padded_bounds(0, image.width(), image.height());
    if x1 <= x0 || y1 <= y0 {
        return resize_square(image, ALIGNED_SIZE);
    }
    let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    resize_square(&crop, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_face_crop_without_landmarks_uses_box() {
        let mut img = RgbImage::from_pixel(200, 200, Rgb([0, 0, 0]));
        for y in 50..150 {
            for x in 50..150 {
                img.put_pixel(x, y, Rgb([200, 10, 10]));
            }
        }
        let face = BoundingBox {
            x: 50.0, y: 50.0, width: 100.0, height: 100.0,
            confidence: 0.9, landmarks: None,
        };
        let crop = face_crop(&img, &face);
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*crop.get_pixel(56, 56), Rgb([200, 10, 10]));
    }

    #[test]
    fn test_face_crop_degenerate_box_falls_back_to_whole_image() {
        let img = RgbImage::from_pixel(60, 40, Rgb([7, 7, 7]));
        let face = BoundingBox {
            x: 500.0, y: 500.0, width: 10.0, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        let crop = face_crop(&img, &face);
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err();
        assert!(matches!(err, Some(RecognizerError::ModelNotFound(_))));
    }

    struct Fixed(Option<Vec<f32>>);

    impl EmbeddingModel for Fixed {
        fn embed(&mut self, _image: &RgbImage) -> Result<Embedding, RecognizerError> {
            self.0.clone().map(Embedding::new).ok_or(RecognizerError::NoFaceDetected)
        }
        fn embedding_dim(&self) -> usize {
            3
        }
    }

    #[test]
    fn test_boxed_model_delegates() {
        let img = RgbImage::new(1, 1);
        let mut found: Box<dyn EmbeddingModel> = Box::new(Fixed(Some(vec![1.0, 2.0, 3.0])));
        assert_eq!(found.embedding_dim(), 3);
        assert_eq!(found.embed(&img).unwrap().values, vec![1.0, 2.0, 3.0]);

        let mut missing: Box<dyn EmbeddingModel> = Box::new(Fixed(None));
        assert!(matches!(missing.embed(&img), Err(RecognizerError::NoFaceDetected)));
    }
}
