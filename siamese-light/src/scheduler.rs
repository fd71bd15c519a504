//! Learning rate reduction on a validation-loss plateau.

/// Lowers the learning rate when the monitored loss stops improving.
///
/// A value counts as an improvement when it beats the best seen so far by more
/// than `threshold` relative to it. After more than `patience` epochs without
/// improvement the rate is multiplied by `factor`, never going below `min_lr`.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    threshold: f64,
    eps: f64,
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            factor: 0.1,
            patience: 10,
            min_lr: 1e-5,
            threshold: 1e-4,
            eps: 1e-8,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn is_better(&self, current: f64) -> bool {
        current < self.best * (1.0 - self.threshold)
    }

    /// Feed one epoch's monitored loss. Returns the new rate if it was reduced.
    pub fn step(&mut self, metric: f64) -> Option<f64> {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs <= self.patience {
            return None;
        }
        self.num_bad_epochs = 0;

        let new_lr = (self.lr * self.factor).max(self.min_lr);
        if self.lr - new_lr > self.eps {
            self.lr = new_lr;
            Some(new_lr)
        } else {
            None
        }
    }
}
