//! Chronological (unshuffled) splitting of aligned features and labels.

use super::matrix::FeatureMatrix;
use super::FeatureError;
use std::ops::Range;

/// Leading/trailing row ranges of a chronological split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChronoSplit {
    pub head: Range<usize>,
    pub tail: Range<usize>,
}

impl ChronoSplit {
    /// Split `n` rows so the trailing `tail_fraction` (rounded up) goes to the tail.
    ///
    /// Both sides always get at least one row, so `n` must be at least 2.
    pub fn new(n: usize, tail_fraction: f64) -> Result<Self, FeatureError> {
        if !(tail_fraction > 0.0 && tail_fraction < 1.0) {
            return Err(FeatureError::InvalidFraction(tail_fraction));
        }
        if n < 2 {
            return Err(FeatureError::TooFewRows { needed: 2, actual: n });
        }
        let tail = ((n as f64) * tail_fraction).ceil() as usize;
        let tail = tail.clamp(1, n - 1);
        let cut = n - tail;
        Ok(Self {
            head: 0..cut,
            tail: cut..n,
        })
    }

    pub fn cut(&self) -> usize {
        self.head.end
    }
}

/// Aligned features/labels for one side of a split.
#[derive(Debug, Clone)]
pub struct Partition {
    pub features: FeatureMatrix,
    pub labels: Vec<f64>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Split aligned features and labels chronologically into `(head, tail)`.
pub fn chronological_split(
    features: &FeatureMatrix,
    labels: &[f64],
    tail_fraction: f64,
) -> Result<(Partition, Partition), FeatureError> {
    if features.n_rows() != labels.len() {
        return Err(FeatureError::LengthMismatch {
            features: features.n_rows(),
            labels: labels.len(),
        });
    }
    let split = ChronoSplit::new(labels.len(), tail_fraction)?;
    let head = Partition {
        features: features.slice_rows(split.head.clone()),
        labels: labels[split.head.clone()].to_vec(),
    };
    let tail = Partition {
        features: features.slice_rows(split.tail.clone()),
        labels: labels[split.tail].to_vec(),
    };
    Ok((head, tail))
}
