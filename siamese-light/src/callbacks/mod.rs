//! Callback system for training hooks.

mod predictions;

pub use predictions::PredictionWriter;

use crate::trainer::{EpochRecord, PhaseOutput, StepOutput, TrainReport};
use crate::TrainerConfig;
use candle::Result;

pub trait Callback: Send {
    fn on_fit_start(&mut self, _config: &TrainerConfig) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _report: &TrainReport) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _record: &EpochRecord) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(&mut self, _batch_idx: usize, _output: &StepOutput) -> Result<()> {
        Ok(())
    }

    /// Called after every phase, including the single pass of
    /// [`Trainer::test`](crate::Trainer::test).
    fn on_phase_end(&mut self, _output: &PhaseOutput) -> Result<()> {
        Ok(())
    }
}
