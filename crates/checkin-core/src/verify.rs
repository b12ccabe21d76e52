//! Pairwise face verification by embedding distance.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Euclidean distance between L2-normalized embeddings, 1.10 ≈ cos 0.395.
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f32 = 1.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `||a/|a| - b/|b|||`, in `[0, 2]`.
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`, in `[0, 2]`.
    Cosine,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.l2_normalized().euclidean_distance(&b.l2_normalized()),
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub same_person: bool,
    pub distance: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub left: PathBuf,
    pub right: PathBuf,
    #[serde(flatten)]
    pub result: VerificationResult,
}

/// Records kept in memory; the oldest is dropped once the log is full.
pub const MAX_LOG_RECORDS: usize = 10_000;

/// Distances accumulated across verification calls for external plotting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationLog {
    pub metric: DistanceMetric,
    pub records: VecDeque<VerificationRecord>,
}

impl VerificationLog {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, left: &Path, right: &Path, result: VerificationResult) {
        if self.records.len() >= MAX_LOG_RECORDS {
            self.records.pop_front();
        }
        self.records.push_back(VerificationRecord {
            left: left.to_path_buf(),
            right: right.to_path_buf(),
            result,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn distances(&self) -> impl Iterator<Item = f32> + '_ {
        self.records.iter().map(|r| r.result.distance)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verifier {
    metric: DistanceMetric,
    threshold: f32,
}

impl Verifier {
    pub fn new(metric: DistanceMetric, threshold: f32) -> Self {
        Self { metric, threshold }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Same person when the distance is at or below the threshold.
    pub fn compare(&self, a: &Embedding, b: &Embedding) -> VerificationResult {
        let distance = self.metric.distance(a, b);
        VerificationResult {
            same_person: distance <= self.threshold,
            distance,
            threshold: self.threshold,
        }
    }
}

impl Default for Verifier {
    fn default() -> Self {
        Self::new(DistanceMetric::Euclidean, DEFAULT_EUCLIDEAN_THRESHOLD)
    }
}
