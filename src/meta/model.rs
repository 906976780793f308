//! Strategy-selector classifier
//!
//! Binary logistic regression fit by batch gradient descent on nalgebra
//! types. Label 1 means architecture A (hardcoded) won, label 0 means
//! architecture B (strategy layer) won. Features are standardized at fit
//! time; the scaler travels with the model so prediction sees the same
//! space.

use nalgebra::{DMatrix, DVector};

const LEARNING_RATE: f64 = 0.1;
const ITERATIONS: usize = 500;

/// Trained logistic-regression model
#[derive(Debug, Clone)]
pub struct LogisticModel {
    weights: DVector<f64>,
    bias: f64,
    feature_means: DVector<f64>,
    feature_stds: DVector<f64>,
}

impl LogisticModel {
    /// Fit on a feature matrix and binary labels; returns the model and its
    /// training accuracy on the same set
    pub fn fit(features: &[Vec<f64>], labels: &[u8]) -> anyhow::Result<(Self, f64)> {
        let n = features.len();
        anyhow::ensure!(n > 0, "cannot fit on an empty sample set");
        anyhow::ensure!(n == labels.len(), "feature/label length mismatch");
        let dim = features[0].len();
        anyhow::ensure!(dim > 0, "cannot fit on zero-dimensional features");
        anyhow::ensure!(
            features.iter().all(|row| row.len() == dim),
            "inconsistent feature dimensions"
        );
        anyhow::ensure!(
            features.iter().flatten().all(|v| v.is_finite()),
            "non-finite feature value"
        );

        let raw = DMatrix::from_fn(n, dim, |row, col| features[row][col]);
        let (matrix, means, stds) = standardize(&raw);
        let targets = DVector::from_fn(n, |row, _| f64::from(labels[row]));

        let mut weights = DVector::zeros(dim);
        let mut bias = 0.0;

        for _ in 0..ITERATIONS {
            let logits = &matrix * &weights + DVector::repeat(n, bias);
            let probabilities = logits.map(sigmoid);
            let residual = &probabilities - &targets;

            let gradient = matrix.transpose() * &residual / n as f64;
            weights -= gradient * LEARNING_RATE;
            bias -= residual.mean() * LEARNING_RATE;
        }

        let model = Self {
            weights,
            bias,
            feature_means: means,
            feature_stds: stds,
        };

        let correct = features
            .iter()
            .zip(labels)
            .filter(|(row, label)| model.predict(row) == **label)
            .count();
        let accuracy = correct as f64 / n as f64;
        Ok((model, accuracy))
    }

    /// Probability pair `[p(label 0), p(label 1)]`
    pub fn predict_proba(&self, features: &[f64]) -> [f64; 2] {
        let scaled = DVector::from_fn(features.len(), |row, _| {
            (features[row] - self.feature_means[row]) / self.feature_stds[row]
        });
        let p1 = sigmoid(self.weights.dot(&scaled) + self.bias);
        [1.0 - p1, p1]
    }

    /// Hard label: 1 for architecture A, 0 for architecture B
    pub fn predict(&self, features: &[f64]) -> u8 {
        u8::from(self.predict_proba(features)[1] >= 0.5)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Column-wise standardization; zero-variance columns keep unit scale
fn standardize(matrix: &DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
    let n = matrix.nrows();
    let dim = matrix.ncols();
    let mut means = DVector::zeros(dim);
    let mut stds = DVector::repeat(dim, 1.0);

    for col in 0..dim {
        let column = matrix.column(col);
        let mean = column.mean();
        let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        means[col] = mean;
        if variance > 1e-12 {
            stds[col] = variance.sqrt();
        }
    }

    let standardized =
        DMatrix::from_fn(n, dim, |row, col| (matrix[(row, col)] - means[col]) / stds[col]);
    (standardized, means, stds)
}
