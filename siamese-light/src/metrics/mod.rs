//! Metrics for tracking training progress.

use candle::{DType, Result, Tensor};

pub const DEFAULT_ACCURACY_THRESHOLD: f64 = 0.01;

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
    fn reset(&mut self);
}

/// Counts predictions lying within a fixed absolute distance of their target.
#[derive(Clone, Debug)]
pub struct ClosenessAccuracy {
    threshold: f64,
    correct: usize,
    total: usize,
}

impl ClosenessAccuracy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            correct: 0,
            total: 0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of `preds` within `threshold` of `targets`, without touching the
    /// running counts.
    pub fn count_correct(&self, preds: &Tensor, targets: &Tensor) -> Result<usize> {
        let hits = preds
            .sub(targets)?
            .abs()?
            .le(self.threshold)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(hits as usize)
    }
}

impl Default for ClosenessAccuracy {
    fn default() -> Self {
        Self::new(DEFAULT_ACCURACY_THRESHOLD)
    }
}

impl Metric for ClosenessAccuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        self.correct += self.count_correct(preds, targets)?;
        self.total += targets.elem_count();
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Running loss and accuracy over one epoch.
///
/// Loss is accumulated weighted by batch size so the epoch loss is a mean over
/// examples, not over batches.
#[derive(Clone, Debug, Default)]
pub struct EpochMetrics {
    cumulative_loss: f64,
    correct: usize,
    examples: usize,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch with mean loss `batch_loss` over `batch_size` examples.
    pub fn record(&mut self, batch_loss: f64, correct: usize, batch_size: usize) {
        self.cumulative_loss += batch_loss * batch_size as f64;
        self.correct += correct;
        self.examples += batch_size;
    }

    pub fn examples(&self) -> usize {
        self.examples
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn loss(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.cumulative_loss / self.examples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            self.correct as f64 / self.examples as f64
        }
    }
}
