//! Training loop implementation.

use crate::checkpoint::{self, BestCheckpoint};
use crate::data::{BatchSource, PairBatch};
use crate::metrics::{ClosenessAccuracy, EpochMetrics};
use crate::runs::Prediction;
use crate::scheduler::ReduceLrOnPlateau;
use crate::{Callback, PairModule, Phase, TrainerConfig};
use candle::{DType, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::path::Path;
use std::time::{Duration, Instant};

/// Loss between scores and labels, both `(B,)`.
pub type Criterion = fn(&Tensor, &Tensor) -> Result<Tensor>;

/// Metrics of one optimisation step.
#[derive(Clone, Debug)]
pub struct StepOutput {
    pub loss: f64,
    pub correct: usize,
    pub batch_size: usize,
}

/// Result of running one phase over all of its batches.
#[derive(Clone, Debug)]
pub struct PhaseOutput {
    pub phase: Phase,
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    /// Per-example scores in batch order; left empty for the train phase.
    pub predictions: Vec<Prediction>,
}

#[derive(Clone, Debug)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub validation_loss: f64,
    pub validation_accuracy: f64,
    /// Rate in effect after the scheduler saw this epoch.
    pub learning_rate: f64,
    pub checkpointed: bool,
}

#[derive(Clone, Debug)]
pub struct TrainReport {
    pub history: Vec<EpochRecord>,
    pub best_accuracy: f64,
    pub best_epoch: Option<usize>,
    pub elapsed: Duration,
}

/// Adam, expressed as AdamW without weight decay.
pub fn adam(vars: Vec<Var>, lr: f64) -> Result<AdamW> {
    AdamW::new(
        vars,
        ParamsAdamW {
            lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )
}

/// Owns the model, its optimiser, the plateau scheduler and the loss, and
/// drives them through train, validation and test phases.
pub struct Trainer<M, O> {
    model: M,
    optimizer: O,
    scheduler: ReduceLrOnPlateau,
    criterion: Criterion,
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    best: Option<BestCheckpoint>,
}

impl<M: PairModule, O: Optimizer> Trainer<M, O> {
    pub fn new(model: M, optimizer: O, config: TrainerConfig) -> Self {
        let scheduler = ReduceLrOnPlateau::new(optimizer.learning_rate())
            .factor(config.lr_factor)
            .patience(config.lr_patience)
            .min_lr(config.min_lr);
        tracing::debug!(
            num_params = model.parameters().len(),
            device = ?config.device,
            "Trainer ready"
        );
        Self {
            model,
            optimizer,
            scheduler,
            criterion: candle_nn::loss::mse,
            config,
            callbacks: Vec::new(),
            best: None,
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Replace the default mean squared error.
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &ReduceLrOnPlateau {
        &self.scheduler
    }

    /// The best-weights tracker of the last [`Trainer::train`] call.
    pub fn best_checkpoint(&self) -> Option<&BestCheckpoint> {
        self.best.as_ref()
    }

    /// Put the best weights of the last training run back into the model.
    pub fn restore_best(&mut self) -> Result<()> {
        match &self.best {
            Some(best) => best.restore(self.model.varmap()),
            None => candle::bail!("no training run to restore weights from"),
        }
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Run `phase` once over `batches`. Only the train phase back-propagates
    /// and steps the optimiser.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        phase: Phase,
        batches: &[PairBatch],
    ) -> Result<PhaseOutput> {
        tracing::info!("Phase: {phase}, Epoch: {epoch}");
        self.model.set_training(phase.is_train());

        let accuracy = ClosenessAccuracy::new(self.config.accuracy_threshold);
        let mut metrics = EpochMetrics::new();
        let mut predictions = Vec::new();

        for (batch_idx, batch) in batches.iter().enumerate() {
            let batch = batch.to_device(&self.config.device)?;
            let batch_size = batch.len()?;
            if batch_size == 0 {
                continue;
            }
            if batch.ids.len() != batch_size {
                candle::bail!(
                    "{phase} batch {batch_idx} has {} ids for {batch_size} examples",
                    batch.ids.len()
                )
            }

            let scores = self.model.forward(&batch.left, &batch.right)?;
            let scores = if phase.is_train() { scores } else { scores.detach() };
            let labels = batch.labels.to_dtype(scores.dtype())?;
            let loss = (self.criterion)(&scores, &labels)?;
            if phase.is_train() {
                self.optimizer.backward_step(&loss)?;
            }

            let step = StepOutput {
                loss: loss.to_dtype(DType::F64)?.to_scalar::<f64>()?,
                correct: accuracy.count_correct(&scores, &labels)?,
                batch_size,
            };
            metrics.record(step.loss, step.correct, step.batch_size);

            if !phase.is_train() {
                let scores = scores.to_dtype(DType::F32)?.to_vec1::<f32>()?;
                let labels = labels.to_dtype(DType::F32)?.to_vec1::<f32>()?;
                predictions.extend(batch.ids.iter().zip(labels).zip(scores).map(
                    |((id, label), score)| Prediction {
                        id: id.clone(),
                        label,
                        score,
                    },
                ));
            }

            let log_every = self.config.log_every_n_steps;
            if log_every > 0 && batch_idx % log_every == 0 {
                tracing::info!(
                    "\tBatch {batch_idx}: Loss: {:.4} Acc: {:.4}",
                    metrics.loss(),
                    metrics.accuracy()
                );
            }

            if phase.is_train() {
                for cb in &mut self.callbacks {
                    cb.on_train_batch_end(batch_idx, &step)?;
                }
            }
        }

        if metrics.examples() == 0 {
            candle::bail!("{phase} phase of epoch {epoch} has no examples")
        }

        let output = PhaseOutput {
            phase,
            epoch,
            loss: metrics.loss(),
            accuracy: metrics.accuracy(),
            predictions,
        };
        tracing::info!("{phase}: Loss: {:.4} Acc: {:.4}", output.loss, output.accuracy);

        for cb in &mut self.callbacks {
            cb.on_phase_end(&output)?;
        }
        Ok(output)
    }

    /// Train for `n_epochs`, validating after each epoch. Weights are written
    /// to `save_path` whenever validation accuracy beats every earlier epoch.
    pub fn train<T, V>(
        &mut self,
        n_epochs: usize,
        train_data: &mut T,
        validation_data: &mut V,
        save_path: impl AsRef<Path>,
    ) -> Result<TrainReport>
    where
        T: BatchSource,
        V: BatchSource,
    {
        let start = Instant::now();
        let mut best = BestCheckpoint::new(save_path.as_ref(), self.model.varmap())?;

        for cb in &mut self.callbacks {
            cb.on_fit_start(&self.config)?;
        }

        let mut history = Vec::with_capacity(n_epochs);
        for epoch in 0..n_epochs {
            for cb in &mut self.callbacks {
                cb.on_epoch_start(epoch)?;
            }

            let batches = train_data.batches(epoch)?;
            let train = self.run_epoch(epoch, Phase::Train, &batches)?;

            let batches = validation_data.batches(epoch)?;
            let validation = self.run_epoch(epoch, Phase::Validation, &batches)?;

            if let Some(lr) = self.scheduler.step(validation.loss) {
                tracing::info!(epoch, "Reducing learning rate to {lr:.4e}");
                self.optimizer.set_learning_rate(lr);
            }

            let checkpointed = best.observe(epoch, validation.accuracy, self.model.varmap())?;

            let record = EpochRecord {
                epoch,
                train_loss: train.loss,
                train_accuracy: train.accuracy,
                validation_loss: validation.loss,
                validation_accuracy: validation.accuracy,
                learning_rate: self.optimizer.learning_rate(),
                checkpointed,
            };
            for cb in &mut self.callbacks {
                cb.on_epoch_end(&record)?;
            }
            history.push(record);
        }

        let elapsed = start.elapsed();
        let secs = elapsed.as_secs();
        tracing::info!("Training complete in {}m {}s", secs / 60, secs % 60);
        tracing::info!("Best validation Accuracy: {:.4}.", best.best_accuracy());

        let report = TrainReport {
            history,
            best_accuracy: best.best_accuracy(),
            best_epoch: best.best_epoch(),
            elapsed,
        };
        self.best = Some(best);

        for cb in &mut self.callbacks {
            cb.on_fit_end(&report)?;
        }
        Ok(report)
    }

    /// Load the weights at `load_path` and evaluate them once on `test_data`.
    pub fn test<S: BatchSource>(
        &mut self,
        load_path: impl AsRef<Path>,
        test_data: &mut S,
    ) -> Result<PhaseOutput> {
        checkpoint::load(self.model.varmap_mut(), load_path.as_ref())?;
        let batches = test_data.batches(0)?;
        self.run_epoch(0, Phase::Test, &batches)
    }
}
