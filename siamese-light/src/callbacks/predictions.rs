//! Writes validation and test predictions to disk.

use super::Callback;
use crate::runs::{self, PREDICTIONS_DIR};
use crate::trainer::PhaseOutput;
use candle::Result;
use std::path::PathBuf;

pub struct PredictionWriter {
    dirpath: PathBuf,
    written: Vec<PathBuf>,
}

impl PredictionWriter {
    /// Files go to `dirpath` directly.
    pub fn new(dirpath: impl Into<PathBuf>) -> Self {
        Self {
            dirpath: dirpath.into(),
            written: Vec::new(),
        }
    }

    /// Files go to the `predictions/` folder of a run directory.
    pub fn for_run(run_dir: impl Into<PathBuf>) -> Self {
        Self::new(run_dir.into().join(PREDICTIONS_DIR))
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl Callback for PredictionWriter {
    fn on_phase_end(&mut self, output: &PhaseOutput) -> Result<()> {
        if output.phase.is_train() {
            return Ok(());
        }
        let path = self
            .dirpath
            .join(runs::prediction_file_name(output.phase, output.epoch));
        runs::write_predictions(&path, &output.predictions)?;
        tracing::debug!(path = %path.display(), n = output.predictions.len(), "Wrote predictions");
        self.written.push(path);
        Ok(())
    }
}
