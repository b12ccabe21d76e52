//! Trainable classifier head: `embedding → Linear → ReLU → Linear → logits`.
//!
//! Weights follow the `[out, in]` row layout, so row `k` of the output layer
//! belongs to label `k`. That is what makes output resizing well defined.

use crate::dataset::LabelMap;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use thiserror::Error;

pub const DEFAULT_HIDDEN_DIM: usize = 256;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier needs at least one class")]
    NoClasses,
    #[error("layer dimensions must be non-zero")]
    ZeroDimension,
    #[error("expected {expected}-dim input, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("{features} feature rows but {labels} labels")]
    LengthMismatch { features: usize, labels: usize },
    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("empty batch")]
    EmptyBatch,
}

/// Affine layer with `[out, in]` weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Uniform(-1/sqrt(in), 1/sqrt(in)) for weights and bias.
    pub fn init<R: Rng + ?Sized>(input: usize, output: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (input as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Self {
            weight: Array2::from_shape_fn((output, input), |_| dist.sample(&mut *rng)),
            bias: Array1::from_shape_fn(output, |_| dist.sample(&mut *rng)),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        x.dot(&self.weight.t()) + &self.bias
    }
}

/// Gradients for one [`Linear`], same shapes as the layer.
#[derive(Debug, Clone)]
pub struct LinearGrad {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Full-batch loss, accuracy counts and gradients.
#[derive(Debug, Clone)]
pub struct BatchGradients {
    /// Mean cross-entropy over the batch.
    pub loss: f32,
    pub correct: usize,
    pub fc1: LinearGrad,
    pub fc2: LinearGrad,
}

/// Arg-max label and its softmax probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: usize,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierHead {
    pub(crate) fc1: Linear,
    pub(crate) fc2: Linear,
}

impl ClassifierHead {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self, ClassifierError> {
        if num_classes == 0 {
            return Err(ClassifierError::NoClasses);
        }
        if input_dim == 0 || hidden_dim == 0 {
            return Err(ClassifierError::ZeroDimension);
        }
        Ok(Self {
            fc1: Linear::init(input_dim, hidden_dim, rng),
            fc2: Linear::init(hidden_dim, num_classes, rng),
        })
    }

    /// Assemble a head from existing layers, checking that they chain.
    pub fn from_layers(fc1: Linear, fc2: Linear) -> Result<Self, ClassifierError> {
        if fc2.output_dim() == 0 {
            return Err(ClassifierError::NoClasses);
        }
        if fc1.input_dim() == 0 || fc1.output_dim() == 0 {
            return Err(ClassifierError::ZeroDimension);
        }
        if fc1.bias.len() != fc1.output_dim() {
            return Err(ClassifierError::DimensionMismatch {
                expected: fc1.output_dim(),
                got: fc1.bias.len(),
            });
        }
        if fc2.input_dim() != fc1.output_dim() {
            return Err(ClassifierError::DimensionMismatch {
                expected: fc1.output_dim(),
                got: fc2.input_dim(),
            });
        }
        if fc2.bias.len() != fc2.output_dim() {
            return Err(ClassifierError::DimensionMismatch {
                expected: fc2.output_dim(),
                got: fc2.bias.len(),
            });
        }
        Ok(Self { fc1, fc2 })
    }

    pub fn input_dim(&self) -> usize {
        self.fc1.input_dim()
    }

    pub fn hidden_dim(&self) -> usize {
        self.fc1.output_dim()
    }

    pub fn num_classes(&self) -> usize {
        self.fc2.output_dim()
    }

    pub fn layers(&self) -> (&Linear, &Linear) {
        (&self.fc1, &self.fc2)
    }

    fn check_input(&self, x: &ArrayView2<f32>) -> Result<(), ClassifierError> {
        if x.nrows() == 0 {
            return Err(ClassifierError::EmptyBatch);
        }
        if x.ncols() != self.input_dim() {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.input_dim(),
                got: x.ncols(),
            });
        }
        Ok(())
    }

    /// Class scores (logits), one row per input row.
    pub fn forward(&self, x: &ArrayView2<f32>) -> Result<Array2<f32>, ClassifierError> {
        self.check_input(x)?;
        let hidden = self.fc1.forward(x).mapv(relu);
        Ok(self.fc2.forward(&hidden.view()))
    }

    pub fn predict(&self, embedding: &[f32]) -> Result<Prediction, ClassifierError> {
        let x = ArrayView2::from_shape((1, embedding.len()), embedding).map_err(|_| {
            ClassifierError::DimensionMismatch {
                expected: self.input_dim(),
                got: embedding.len(),
            }
        })?;
        let logits = self.forward(&x)?;
        let probs = softmax(logits.row(0));
        let label = argmax(probs.view());
        Ok(Prediction {
            label,
            confidence: probs[label],
        })
    }

    /// Mean softmax cross-entropy against integer labels and its gradients.
    pub fn gradients(
        &self,
        x: &ArrayView2<f32>,
        labels: &[usize],
    ) -> Result<BatchGradients, ClassifierError> {
        self.check_input(x)?;
        if labels.len() != x.nrows() {
            return Err(ClassifierError::LengthMismatch {
                features: x.nrows(),
                labels: labels.len(),
            });
        }
        let classes = self.num_classes();
        if let Some(&label) = labels.iter().find(|&&l| l >= classes) {
            return Err(ClassifierError::LabelOutOfRange { label, classes });
        }

        let n = x.nrows() as f32;
        let z1 = self.fc1.forward(x);
        let hidden = z1.mapv(relu);
        let logits = self.fc2.forward(&hidden.view());

        let mut loss = 0.0f32;
        let mut correct = 0usize;
        let mut dlogits = Array2::<f32>::zeros(logits.raw_dim());
        for (i, row) in logits.rows().into_iter().enumerate() {
            let target = labels[i];
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let sum: f32 = row.iter().map(|v| (v - max).exp()).sum();
            loss += sum.ln() + max - row[target];
            if argmax(row) == target {
                correct += 1;
            }
            let mut grad = dlogits.row_mut(i);
            for (g, v) in grad.iter_mut().zip(row.iter()) {
                *g = (v - max).exp() / sum / n;
            }
            grad[target] -= 1.0 / n;
        }

        let fc2 = LinearGrad {
            weight: dlogits.t().dot(&hidden),
            bias: dlogits.sum_axis(Axis(0)),
        };
        let mut dz1 = dlogits.dot(&self.fc2.weight);
        dz1.zip_mut_with(&z1, |g, &z| {
            if z <= 0.0 {
                *g = 0.0;
            }
        });
        let fc1 = LinearGrad {
            weight: dz1.t().dot(x),
            bias: dz1.sum_axis(Axis(0)),
        };

        Ok(BatchGradients {
            loss: loss / n,
            correct,
            fc1,
            fc2,
        })
    }

    /// Change the number of output classes positionally.
    ///
    /// Rows `0..min(old, new)` of the output layer are kept exactly; any new
    /// rows are freshly initialized.
    pub fn resize_output<R: Rng + ?Sized>(
        &mut self,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<(), ClassifierError> {
        let sources: Vec<Option<usize>> = (0..num_classes)
            .map(|k| (k < self.num_classes()).then_some(k))
            .collect();
        self.rebuild_output(&sources, rng)
    }

    /// Re-key output rows from `old` label order to `new` label order by
    /// person name. People absent from `old` get fresh rows.
    pub fn remap_output<R: Rng + ?Sized>(
        &mut self,
        old: &LabelMap,
        new: &LabelMap,
        rng: &mut R,
    ) -> Result<(), ClassifierError> {
        let current = self.num_classes();
        let sources: Vec<Option<usize>> = new
            .names()
            .iter()
            .map(|name| old.label_of(name).filter(|&k| k < current))
            .collect();
        self.rebuild_output(&sources, rng)
    }

    fn rebuild_output<R: Rng + ?Sized>(
        &mut self,
        sources: &[Option<usize>],
        rng: &mut R,
    ) -> Result<(), ClassifierError> {
        if sources.is_empty() {
            return Err(ClassifierError::NoClasses);
        }
        let mut fresh = Linear::init(self.hidden_dim(), sources.len(), rng);
        for (row, source) in sources.iter().enumerate() {
            if let Some(k) = *source {
                fresh
                    .weight
                    .slice_mut(s![row, ..])
                    .assign(&self.fc2.weight.slice(s![k, ..]));
                fresh.bias[row] = self.fc2.bias[k];
            }
        }
        self.fc2 = fresh;
        Ok(())
    }
}

#[inline]
fn relu(v: f32) -> f32 {
    v.max(0.0)
}

pub(crate) fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn softmax(row: ArrayView1<f32>) -> Array1<f32> {
    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let exp = row.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_shapes() {
        let head = ClassifierHead::new(512, 256, 3, &mut rng()).unwrap();
        assert_eq!((head.input_dim(), head.hidden_dim(), head.num_classes()), (512, 256, 3));
        let x = Array2::<f32>::zeros((4, 512));
        assert_eq!(head.forward(&x.view()).unwrap().shape(), &[4, 3]);
    }

    #[test]
    fn test_rejects_bad_construction_and_input() {
        assert!(matches!(
            ClassifierHead::new(8, 4, 0, &mut rng()),
            Err(ClassifierError::NoClasses)
        ));
        let head = ClassifierHead::new(8, 4, 2, &mut rng()).unwrap();
        assert!(matches!(
            head.predict(&[0.0; 5]),
            Err(ClassifierError::DimensionMismatch { expected: 8, got: 5 })
        ));
        let empty = Array2::<f32>::zeros((0, 8));
        assert!(matches!(head.forward(&empty.view()), Err(ClassifierError::EmptyBatch)));
        let x = Array2::<f32>::zeros((2, 8));
        assert!(matches!(
            head.gradients(&x.view(), &[0]),
            Err(ClassifierError::LengthMismatch { features: 2, labels: 1 })
        ));
        assert!(matches!(
            head.gradients(&x.view(), &[0, 2]),
            Err(ClassifierError::LabelOutOfRange { label: 2, classes: 2 })
        ));
    }

    #[test]
    fn test_predict_confidence_is_probability() {
        let head = ClassifierHead::new(6, 5, 4, &mut rng()).unwrap();
        let p = head.predict(&[0.1, -0.2, 0.3, 0.9, 0.0, 1.0]).unwrap();
        assert!(p.label < 4);
        assert!(p.confidence > 0.25 - 1e-6 && p.confidence <= 1.0);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut head = ClassifierHead::new(3, 4, 3, &mut rng()).unwrap();
        let x = Array2::from_shape_vec((2, 3), vec![0.5, -1.0, 2.0, 1.5, 0.3, -0.7]).unwrap();
        let labels = [2, 0];
        let grads = head.gradients(&x.view(), &labels).unwrap();

        let eps = 1e-3f32;
        for &(r, c) in &[(0usize, 0usize), (1, 2), (2, 3)] {
            let orig = head.fc2.weight[[r, c]];
            head.fc2.weight[[r, c]] = orig + eps;
            let up = head.gradients(&x.view(), &labels).unwrap().loss;
            head.fc2.weight[[r, c]] = orig - eps;
            let down = head.gradients(&x.view(), &labels).unwrap().loss;
            head.fc2.weight[[r, c]] = orig;
            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (numeric - grads.fc2.weight[[r, c]]).abs() < 2e-3,
                "fc2[{r},{c}]: numeric {numeric} vs analytic {}",
                grads.fc2.weight[[r, c]]
            );
        }

        let orig = head.fc2.bias[1];
        head.fc2.bias[1] = orig + eps;
        let up = head.gradients(&x.view(), &labels).unwrap().loss;
        head.fc2.bias[1] = orig - eps;
        let down = head.gradients(&x.view(), &labels).unwrap().loss;
        head.fc2.bias[1] = orig;
        assert!(((up - down) / (2.0 * eps) - grads.fc2.bias[1]).abs() < 2e-3);

        assert_eq!(grads.fc1.weight.shape(), &[4, 3]);
        assert_eq!(grads.fc1.bias.len(), 4);
    }

    #[test]
    fn test_resize_output_preserves_existing_rows() {
        let mut r = rng();
        let mut head = ClassifierHead::new(16, 8, 2, &mut r).unwrap();
        let before = head.fc2.clone();
        let hidden_before = head.fc1.clone();

        head.resize_output(5, &mut r).unwrap();
        assert_eq!(head.num_classes(), 5);
        assert_eq!(head.fc2.weight.slice(s![0..2, ..]), before.weight);
        assert_eq!(head.fc2.bias.slice(s![0..2]), before.bias);
        assert_eq!(head.fc1, hidden_before);

        head.resize_output(1, &mut r).unwrap();
        assert_eq!(head.num_classes(), 1);
        assert_eq!(head.fc2.weight.row(0), before.weight.row(0));
    }

    #[test]
    fn test_remap_output_by_name() {
        let mut r = rng();
        let mut head = ClassifierHead::new(4, 3, 2, &mut r).unwrap();
        let alice = head.fc2.weight.row(0).to_owned();
        let bob = head.fc2.weight.row(1).to_owned();

        let old = LabelMap::new(vec!["alice".into(), "bob".into()]).unwrap();
        let new = LabelMap::new(vec!["aaron".into(), "alice".into(), "bob".into()]).unwrap();
        head.remap_output(&old, &new, &mut r).unwrap();

        assert_eq!(head.num_classes(), 3);
        assert_eq!(head.fc2.weight.row(1), alice);
        assert_eq!(head.fc2.weight.row(2), bob);
    }

    #[test]
    fn test_from_layers_checks_chaining() {
        let mut r = rng();
        let fc1 = Linear::init(4, 3, &mut r);
        let bad_fc2 = Linear::init(5, 2, &mut r);
        assert!(matches!(
            ClassifierHead::from_layers(fc1.clone(), bad_fc2),
            Err(ClassifierError::DimensionMismatch { expected: 3, got: 5 })
        ));
        let fc2 = Linear::init(3, 2, &mut r);
        assert!(ClassifierHead::from_layers(fc1, fc2).is_ok());
    }
}
