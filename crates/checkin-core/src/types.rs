use serde::{Deserialize, Serialize};

/// Axis-aligned box in source-image pixels, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Grow the box by `padding` pixels on every side and clamp it to a
    /// `width`×`height` image. Returns integer pixel bounds `(x0, y0, x1, y1)`,
    /// exclusive on the right/bottom edge.
    pub fn padded_bounds(&self, padding: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let pad = padding as f32;
        let x0 = (self.x - pad).floor().clamp(0.0, width as f32) as u32;
        let y0 = (self.y - pad).floor().clamp(0.0, height as f32) as u32;
        let x1 = (self.x + self.width + pad).ceil().clamp(0.0, width as f32) as u32;
        let y1 = (self.y + self.height + pad).ceil().clamp(0.0, height as f32) as u32;
        (x0, y0, x1, y1)
    }
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
pub(crate) fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy. A zero vector is returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity in [-1, 1]; 0 when either vector is zero.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap 50, union 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_and_degenerate() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(a.iou(&b), 0.0);
        let empty = bbox(0.0, 0.0, 0.0, 0.0, 1.0);
        assert_eq!(empty.iou(&empty), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let result = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_padded_bounds_clamped() {
        let b = bbox(50.0, 20.0, 100.0, 200.0, 0.9);
        assert_eq!(b.padded_bounds(100, 640, 480), (0, 0, 250, 320));
        assert_eq!(b.padded_bounds(0, 120, 100), (50, 20, 120, 100));
    }

    #[test]
    fn test_distance_identity_and_symmetry() {
        let a = Embedding::new(vec![0.3, -1.2, 4.0]);
        let b = Embedding::new(vec![1.0, 0.5, -2.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
        assert_eq!(a.euclidean_distance(&b), b.euclidean_distance(&a));
        assert_eq!(a.similarity(&b), b.similarity(&a));
    }

    #[test]
    fn test_similarity_cases() {
        let x = Embedding::new(vec![1.0, 0.0]);
        let y = Embedding::new(vec![0.0, 1.0]);
        let neg = Embedding::new(vec![-1.0, 0.0]);
        let zero = Embedding::new(vec![0.0, 0.0]);
        assert!((x.similarity(&x) - 1.0).abs() < 1e-6);
        assert!(x.similarity(&y).abs() < 1e-6);
        assert!((x.similarity(&neg) + 1.0).abs() < 1e-6);
        assert_eq!(zero.similarity(&x), 0.0);
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        let zero = Embedding::new(vec![0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }
}
