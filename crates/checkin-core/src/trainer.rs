//! Full-batch SGD-with-momentum training for the classifier head.

use crate::classifier::{argmax, BatchGradients, ClassifierError, ClassifierHead, Linear};
use crate::types::Embedding;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("{embeddings} embeddings but {labels} labels")]
    LengthMismatch { embeddings: usize, labels: usize },
    #[error("embedding {index} has {got} values, expected {expected}")]
    RaggedEmbeddings {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("invalid hyperparameter {key}: {reason}")]
    InvalidHyperparameter { key: String, reason: String },
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

fn invalid(key: &str, reason: impl Into<String>) -> TrainError {
    TrainError::InvalidHyperparameter {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Stop once loss has not improved by `min_delta` for `patience` epochs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    pub patience: usize,
    pub min_delta: f32,
}

/// Upper bound on `epochs`. Every epoch's metrics are kept in the report.
pub const MAX_EPOCHS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    #[serde(default)]
    pub early_stop: Option<EarlyStop>,
    #[serde(default)]
    pub stop_at_perfect_accuracy: bool,
    /// Log metrics at `info` every N epochs (others go to `debug`).
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
}

fn default_log_interval() -> usize {
    10
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.001,
            momentum: 0.9,
            early_stop: None,
            stop_at_perfect_accuracy: false,
            log_interval: default_log_interval(),
        }
    }
}

impl Hyperparameters {
    pub const KEY_EPOCHS: &'static str = "NUM_EPOCHS";
    pub const KEY_LEARNING_RATE: &'static str = "LEARNING_RATE";
    pub const KEY_MOMENTUM: &'static str = "MOMENTUM";
    pub const KEY_PATIENCE: &'static str = "EARLY_STOP_PATIENCE";
    pub const KEY_MIN_DELTA: &'static str = "MIN_LOSS_DELTA";

    pub fn validate(&self) -> Result<(), TrainError> {
        if !(1..=MAX_EPOCHS).contains(&self.epochs) {
            return Err(invalid(Self::KEY_EPOCHS, format!("must be in 1..={MAX_EPOCHS}")));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid(Self::KEY_LEARNING_RATE, "must be a positive number"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(invalid(Self::KEY_MOMENTUM, "must be in [0, 1)"));
        }
        if let Some(rule) = self.early_stop {
            if rule.patience == 0 {
                return Err(invalid(Self::KEY_PATIENCE, "must be at least 1"));
            }
            if !(rule.min_delta.is_finite() && rule.min_delta >= 0.0) {
                return Err(invalid(Self::KEY_MIN_DELTA, "must be a non-negative number"));
            }
        }
        Ok(())
    }

    /// Override fields from a flat key/value payload
    /// (`NUM_EPOCHS`, `LEARNING_RATE`, `MOMENTUM`). Unknown keys are ignored.
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Result<Self, TrainError> {
        for (key, value) in overrides {
            let value = value.trim();
            match key.as_str() {
                Self::KEY_EPOCHS => {
                    self.epochs = value.parse().map_err(|_| invalid(key, format!("{value:?} is not an integer")))?
                }
                Self::KEY_LEARNING_RATE => {
                    self.learning_rate = value.parse().map_err(|_| invalid(key, format!("{value:?} is not a number")))?
                }
                Self::KEY_MOMENTUM => {
                    self.momentum = value.parse().map_err(|_| invalid(key, format!("{value:?} is not a number")))?
                }
                other => tracing::debug!(key = other, "ignoring unknown hyperparameter"),
            }
        }
        self.validate()?;
        Ok(self)
    }
}

/// Per-epoch training metrics (1-based epoch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f32,
    pub accuracy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EpochBudget,
    Plateau,
    PerfectAccuracy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub examples: usize,
    pub classes: usize,
    pub hyperparameters: Hyperparameters,
    pub epochs: Vec<EpochMetrics>,
    pub stop_reason: StopReason,
}

impl TrainingReport {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// Embeddings stacked row-wise with their labels.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    features: Array2<f32>,
    labels: Vec<usize>,
}

impl TrainingSet {
    pub fn new(embeddings: &[Embedding], labels: &[usize]) -> Result<Self, TrainError> {
        if embeddings.is_empty() || labels.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        if embeddings.len() != labels.len() {
            return Err(TrainError::LengthMismatch {
                embeddings: embeddings.len(),
                labels: labels.len(),
            });
        }
        let dim = embeddings[0].dim();
        let mut flat = Vec::with_capacity(embeddings.len() * dim);
        for (index, e) in embeddings.iter().enumerate() {
            if e.dim() != dim {
                return Err(TrainError::RaggedEmbeddings {
                    index,
                    expected: dim,
                    got: e.dim(),
                });
            }
            flat.extend_from_slice(&e.values);
        }
        let features = Array2::from_shape_vec((embeddings.len(), dim), flat).map_err(|_| {
            TrainError::RaggedEmbeddings {
                index: 0,
                expected: dim,
                got: 0,
            }
        })?;
        Ok(Self {
            features,
            labels: labels.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.features.ncols()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }
}

/// Velocity buffers for one layer.
struct Velocity {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Velocity {
    fn zeros_like(layer: &Linear) -> Self {
        Self {
            weight: Array2::zeros(layer.weight.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }

    /// `v = momentum * v + grad; p -= lr * v`
    fn step(&mut self, layer: &mut Linear, grad_w: &Array2<f32>, grad_b: &Array1<f32>, lr: f32, momentum: f32) {
        self.weight.zip_mut_with(grad_w, |v, &g| *v = momentum * *v + g);
        self.bias.zip_mut_with(grad_b, |v, &g| *v = momentum * *v + g);
        layer.weight.scaled_add(-lr, &self.weight);
        layer.bias.scaled_add(-lr, &self.bias);
    }
}

pub struct Trainer {
    hyper: Hyperparameters,
}

impl Trainer {
    pub fn new(hyper: Hyperparameters) -> Result<Self, TrainError> {
        hyper.validate()?;
        Ok(Self { hyper })
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Fit `head` to `data`. Metrics for each epoch are measured on the
    /// forward pass that precedes that epoch's update.
    pub fn train(&self, head: &mut ClassifierHead, data: &TrainingSet) -> Result<TrainingReport, TrainError> {
        if data.is_empty() {
            return Err(TrainError::EmptyTrainingSet);
        }
        let (lr, momentum) = (self.hyper.learning_rate, self.hyper.momentum);
        let mut v1 = Velocity::zeros_like(&head.fc1);
        let mut v2 = Velocity::zeros_like(&head.fc2);

        let n = data.len() as f32;
        let mut epochs = Vec::new();
        let mut best_loss = f32::INFINITY;
        let mut stale = 0usize;
        let mut stop_reason = StopReason::EpochBudget;

        tracing::info!(
            examples = data.len(),
            classes = head.num_classes(),
            epochs = self.hyper.epochs,
            lr,
            momentum,
            "training classifier head"
        );

        for epoch in 1..=self.hyper.epochs {
            let BatchGradients { loss, correct, fc1, fc2 } =
                head.gradients(&data.features.view(), &data.labels)?;
            v1.step(&mut head.fc1, &fc1.weight, &fc1.bias, lr, momentum);
            v2.step(&mut head.fc2, &fc2.weight, &fc2.bias, lr, momentum);

            let metrics = EpochMetrics {
                epoch,
                loss,
                accuracy: correct as f32 / n,
            };
            epochs.push(metrics);

            if self.hyper.log_interval > 0 && epoch % self.hyper.log_interval == 0 {
                tracing::info!(epoch, total = self.hyper.epochs, loss, accuracy = metrics.accuracy, "epoch");
            } else {
                tracing::debug!(epoch, loss, accuracy = metrics.accuracy, "epoch");
            }

            if self.hyper.stop_at_perfect_accuracy && correct == data.len() {
                stop_reason = StopReason::PerfectAccuracy;
                break;
            }
            if let Some(rule) = self.hyper.early_stop {
                if loss < best_loss - rule.min_delta {
                    best_loss = loss;
                    stale = 0;
                } else {
                    stale += 1;
                    if stale >= rule.patience {
                        stop_reason = StopReason::Plateau;
                        break;
                    }
                }
            }
        }

        if let Some(last) = epochs.last() {
            tracing::info!(
                epochs_run = epochs.len(),
                loss = last.loss,
                accuracy = last.accuracy,
                ?stop_reason,
                "training finished"
            );
        }

        Ok(TrainingReport {
            examples: data.len(),
            classes: head.num_classes(),
            hyperparameters: self.hyper.clone(),
            epochs,
            stop_reason,
        })
    }
}

/// Accuracy of `head` over `data` with the current weights.
pub fn evaluate(head: &ClassifierHead, data: &TrainingSet) -> Result<f32, TrainError> {
    let logits = head.forward(&data.features.view())?;
    let correct = logits
        .rows()
        .into_iter()
        .zip(data.labels.iter())
        .filter(|(row, &label)| argmax(*row) == label)
        .count();
    Ok(correct as f32 / data.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// `classes` clusters, each a distinct block of the 512-d space plus a
    /// small per-sample offset.
    fn separable(classes: usize, per_class: usize) -> (Vec<Embedding>, Vec<usize>) {
        let mut embeddings = Vec::new();
        let mut labels = Vec::new();
        for class in 0..classes {
            for sample in 0..per_class {
                let mut values = vec![0.0f32; 512];
                for v in &mut values[class * 32..(class + 1) * 32] {
                    *v = 0.25;
                }
                values[500 + sample % 12] += 0.05;
                embeddings.push(Embedding::new(values));
                labels.push(class);
            }
        }
        (embeddings, labels)
    }

    fn hyper(epochs: usize, lr: f32) -> Hyperparameters {
        Hyperparameters {
            epochs,
            learning_rate: lr,
            ..Hyperparameters::default()
        }
    }

    #[test]
    fn test_separable_set_reaches_full_accuracy() {
        let (emb, labels) = separable(3, 4);
        let data = TrainingSet::new(&emb, &labels).unwrap();
        let mut head = ClassifierHead::new(512, 256, 3, &mut StdRng::seed_from_u64(42)).unwrap();

        let report = Trainer::new(hyper(300, 0.05)).unwrap().train(&mut head, &data).unwrap();

        assert_eq!(report.epochs.len(), 300);
        assert_eq!(report.stop_reason, StopReason::EpochBudget);
        assert!(report.epochs[299].loss < report.epochs[0].loss);
        assert_eq!(evaluate(&head, &data).unwrap(), 1.0);
        assert_eq!(report.last().unwrap().accuracy, 1.0);
    }

    #[test]
    fn test_stops_at_perfect_accuracy() {
        let (emb, labels) = separable(2, 3);
        let data = TrainingSet::new(&emb, &labels).unwrap();
        let mut head = ClassifierHead::new(512, 256, 2, &mut StdRng::seed_from_u64(1)).unwrap();
        let hp = Hyperparameters {
            stop_at_perfect_accuracy: true,
            ..hyper(1000, 0.05)
        };

        let report = Trainer::new(hp).unwrap().train(&mut head, &data).unwrap();
        assert_eq!(report.stop_reason, StopReason::PerfectAccuracy);
        assert!(report.epochs.len() < 1000);
        assert_eq!(report.last().unwrap().accuracy, 1.0);
    }

    #[test]
    fn test_plateau_stops_after_patience() {
        let (emb, labels) = separable(2, 2);
        let data = TrainingSet::new(&emb, &labels).unwrap();
        let mut head = ClassifierHead::new(512, 16, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let hp = Hyperparameters {
            early_stop: Some(EarlyStop { patience: 3, min_delta: 1.0 }),
            ..hyper(50, 1e-6)
        };

        let report = Trainer::new(hp).unwrap().train(&mut head, &data).unwrap();
        assert_eq!(report.stop_reason, StopReason::Plateau);
        assert_eq!(report.epochs.len(), 4);
    }

    #[test]
    fn test_training_set_validation() {
        assert!(matches!(TrainingSet::new(&[], &[]), Err(TrainError::EmptyTrainingSet)));
        let a = Embedding::new(vec![1.0, 2.0]);
        let b = Embedding::new(vec![1.0]);
        assert!(matches!(
            TrainingSet::new(&[a.clone()], &[0, 1]),
            Err(TrainError::LengthMismatch { embeddings: 1, labels: 2 })
        ));
        assert!(matches!(
            TrainingSet::new(&[a, b], &[0, 1]),
            Err(TrainError::RaggedEmbeddings { index: 1, expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_label_outside_head_is_rejected() {
        let (emb, _) = separable(2, 1);
        let data = TrainingSet::new(&emb, &[0, 5]).unwrap();
        let mut head = ClassifierHead::new(512, 8, 2, &mut StdRng::seed_from_u64(0)).unwrap();
        let err = Trainer::new(hyper(1, 0.01)).unwrap().train(&mut head, &data).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Classifier(ClassifierError::LabelOutOfRange { label: 5, classes: 2 })
        ));
    }

    #[test]
    fn test_key_value_overrides() {
        let mut kv = HashMap::new();
        kv.insert("NUM_EPOCHS".to_string(), "50".to_string());
        kv.insert("LEARNING_RATE".to_string(), " 0.01 ".to_string());
        kv.insert("BATCH_SIZE".to_string(), "64".to_string());
        let hp = Hyperparameters::default().with_overrides(&kv).unwrap();
        assert_eq!(hp.epochs, 50);
        assert!((hp.learning_rate - 0.01).abs() < 1e-9);
        assert!((hp.momentum - 0.9).abs() < 1e-9);

        kv.insert("MOMENTUM".to_string(), "fast".to_string());
        assert!(matches!(
            Hyperparameters::default().with_overrides(&kv),
            Err(TrainError::InvalidHyperparameter { key, .. }) if key == "MOMENTUM"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(hyper(0, 0.1).validate().is_err());
        assert!(hyper(1, 0.0).validate().is_err());
        assert!(hyper(1, f32::NAN).validate().is_err());
        let hp = Hyperparameters { momentum: 1.0, ..Hyperparameters::default() };
        assert!(hp.validate().is_err());
        assert!(hyper(MAX_EPOCHS, 0.1).validate().is_ok());
        assert!(hyper(MAX_EPOCHS + 1, 0.1).validate().is_err());
    }

    #[test]
    fn test_huge_epoch_count_is_rejected_before_training() {
        let mut kv = HashMap::new();
        kv.insert("NUM_EPOCHS".to_string(), usize::MAX.to_string());
        assert!(matches!(
            Hyperparameters::default().with_overrides(&kv),
            Err(TrainError::InvalidHyperparameter { key, .. }) if key == "NUM_EPOCHS"
        ));
        assert!(Trainer::new(hyper(usize::MAX, 0.01)).is_err());
    }

    #[test]
    fn test_early_stop_rule_is_validated() {
        let with_rule = |patience, min_delta| Hyperparameters {
            early_stop: Some(EarlyStop { patience, min_delta }),
            ..Hyperparameters::default()
        };
        assert!(with_rule(3, 1e-4).validate().is_ok());
        assert!(with_rule(3, 0.0).validate().is_ok());
        assert!(matches!(
            with_rule(0, 1e-4).validate(),
            Err(TrainError::InvalidHyperparameter { key, .. }) if key == "EARLY_STOP_PATIENCE"
        ));
        for bad in [-0.1, f32::NAN, f32::INFINITY] {
            assert!(matches!(
                with_rule(3, bad).validate(),
                Err(TrainError::InvalidHyperparameter { key, .. }) if key == "MIN_LOSS_DELTA"
            ));
        }
    }
}
