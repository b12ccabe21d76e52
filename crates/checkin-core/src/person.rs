//! Person detection front-end.
//!
//! A YOLOv8-style ONNX detector finds people in an uploaded photo; each hit
//! is padded and cropped before being handed to the embedding path.

use crate::detector::DetectorError;
use crate::preprocess::{letterbox_tensor, Letterbox, Normalization};
use crate::types::{nms, BoundingBox};
use image::imageops;
use image::RgbImage;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// COCO class id of "person".
pub const PERSON_CLASS_ID: usize = 0;

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: u8 = 114;
const YOLO_NMS_THRESHOLD: f32 = 0.45;

/// A detected person in source-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    pub bbox: BoundingBox,
}

impl PersonDetection {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }

    /// Padded crop of this detection, clamped to the photo.
    pub fn crop(&self, photo: &RgbImage, padding: u32) -> Option<RgbImage> {
        let (x0, y0, x1, y1) = self.bbox.padded_bounds(padding, photo.width(), photo.height());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(imageops::crop_imm(photo, x0, y0, x1 - x0, y1 - y0).to_image())
    }
}

/// Locates people in a raw photo.
pub trait PersonDetector {
    fn detect(&mut self, photo: &RgbImage) -> Result<Vec<PersonDetection>, DetectorError>;
}

impl<T: PersonDetector + ?Sized> PersonDetector for Box<T> {
    fn detect(&mut self, photo: &RgbImage) -> Result<Vec<PersonDetection>, DetectorError> {
        (**self).detect(photo)
    }
}

/// YOLOv8 ONNX export: one output shaped `[1, 4 + classes, anchors]` with
/// centre-format boxes followed by per-class scores.
pub struct YoloPersonDetector {
    session: Session,
    confidence_threshold: f32,
}

impl YoloPersonDetector {
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            confidence_threshold,
            "loaded YOLO person detector"
        );

        Ok(Self {
            session,
            confidence_threshold,
        })
    }
}

impl PersonDetector for YoloPersonDetector {
    fn detect(&mut self, photo: &RgbImage) -> Result<Vec<PersonDetection>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(
            photo,
            YOLO_INPUT_SIZE,
            YOLO_INPUT_SIZE,
            Normalization::UNIT,
            YOLO_PAD_VALUE,
        );

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("yolo output: {e}")))?;

        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected YOLO output shape {:?}",
                &shape[..]
            )));
        }
        let rows = shape[1] as usize;
        let anchors = shape[2] as usize;

        let people = decode_yolo(data, rows, anchors, &letterbox, self.confidence_threshold);
        tracing::debug!(people = people.len(), "person detection done");
        Ok(people)
    }
}

/// Decode a channel-major `[rows, anchors]` YOLO head, keeping anchors whose
/// best class is "person" above `threshold`.
fn decode_yolo(
    data: &[f32],
    rows: usize,
    anchors: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<PersonDetection> {
    if data.len() < rows * anchors || rows < 5 {
        return Vec::new();
    }
    let at = |row: usize, anchor: usize| data[row * anchors + anchor];

    let mut boxes = Vec::new();
    for a in 0..anchors {
        let (best_class, best_score) = (4..rows)
            .map(|r| (r - 4, at(r, a)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        if best_class != PERSON_CLASS_ID || best_score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, a), at(1, a), at(2, a), at(3, a));
        let (x1, y1) = letterbox.to_source(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_source(cx + w / 2.0, cy + h / 2.0);
        boxes.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: best_score,
            landmarks: None,
        });
    }

    nms(boxes, YOLO_NMS_THRESHOLD)
        .into_iter()
        .map(|bbox| PersonDetection { bbox })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Build a `[rows, anchors]` head from per-anchor (cx, cy, w, h, scores...).
    fn head(anchors: &[Vec<f32>]) -> (Vec<f32>, usize, usize) {
        let rows = anchors[0].len();
        let n = anchors.len();
        let mut data = vec![0.0; rows * n];
        for (a, values) in anchors.iter().enumerate() {
            for (r, v) in values.iter().enumerate() {
                data[r * n + a] = *v;
            }
        }
        (data, rows, n)
    }

    #[test]
    fn test_decode_keeps_only_people() {
        let (data, rows, n) = head(&[
            vec![100.0, 100.0, 40.0, 80.0, 0.9, 0.1],  // person
            vec![300.0, 300.0, 40.0, 40.0, 0.2, 0.95], // other class wins
            vec![500.0, 100.0, 40.0, 80.0, 0.3, 0.0],  // person below threshold
        ]);
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let people = decode_yolo(&data, rows, n, &lb, 0.5);
        assert_eq!(people.len(), 1);
        let b = &people[0].bbox;
        assert!((b.x - 80.0).abs() < 1e-4 && (b.y - 60.0).abs() < 1e-4);
        assert!((b.width - 40.0).abs() < 1e-4 && (b.height - 80.0).abs() < 1e-4);
        assert!((people[0].confidence() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_decode_suppresses_duplicates_and_unletterboxes() {
        let (data, rows, n) = head(&[
            vec![320.0, 320.0, 100.0, 200.0, 0.8],
            vec![322.0, 318.0, 100.0, 200.0, 0.7],
        ]);
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 160.0 };
        let people = decode_yolo(&data, rows, n, &lb, 0.5);
        assert_eq!(people.len(), 1);
        let b = &people[0].bbox;
        // (270, 220) in input space -> (135, 30) in source space.
        assert!((b.x - 135.0).abs() < 1e-4 && (b.y - 30.0).abs() < 1e-4);
        assert!((b.width - 50.0).abs() < 1e-4 && (b.height - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_yolo(&[0.0; 3], 5, 10, &lb, 0.5).is_empty());
    }

    #[test]
    fn test_crop_with_padding() {
        let photo = RgbImage::from_pixel(300, 200, Rgb([1, 2, 3]));
        let det = PersonDetection {
            bbox: BoundingBox {
                x: 120.0, y: 50.0, width: 60.0, height: 100.0,
                confidence: 0.9, landmarks: None,
            },
        };
        let crop = det.crop(&photo, 100).unwrap();
        assert_eq!(crop.dimensions(), (260, 200));
        let tight = det.crop(&photo, 10).unwrap();
        assert_eq!(tight.dimensions(), (80, 120));
    }

    #[test]
    fn test_crop_outside_photo() {
        let photo = RgbImage::new(50, 50);
        let det = PersonDetection {
            bbox: BoundingBox {
                x: 100.0, y: 100.0, width: 10.0, height: 10.0,
                confidence: 0.9, landmarks: None,
            },
        };
        assert!(det.crop(&photo, 0).is_none());
    }
}
