//! Best-weights checkpointing.

use candle::{Result, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Keeps the weights of the epoch with the highest validation accuracy.
///
/// Selection is greedy: an epoch replaces the current best only when its
/// accuracy is strictly greater, so ties keep the earlier weights. The
/// snapshot is held in memory and written to `path` on every improvement.
pub struct BestCheckpoint {
    path: PathBuf,
    best_accuracy: f64,
    best_epoch: Option<usize>,
    snapshot: HashMap<String, Tensor>,
}

impl BestCheckpoint {
    /// Starts with a best accuracy of zero, so an epoch that gets nothing
    /// right is never saved.
    pub fn new(path: impl Into<PathBuf>, varmap: &VarMap) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            best_accuracy: 0.0,
            best_epoch: None,
            snapshot: snapshot(varmap)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn is_better(&self, accuracy: f64) -> bool {
        accuracy > self.best_accuracy
    }

    /// Record the validation accuracy of `epoch`. Returns whether the weights
    /// were taken as the new best and saved.
    pub fn observe(&mut self, epoch: usize, accuracy: f64, varmap: &VarMap) -> Result<bool> {
        if !self.is_better(accuracy) {
            return Ok(false);
        }
        self.best_accuracy = accuracy;
        self.best_epoch = Some(epoch);
        self.snapshot = snapshot(varmap)?;

        tracing::info!(
            path = %self.path.display(),
            epoch,
            accuracy,
            "Checkpoint: saving best weights"
        );
        save(varmap, &self.path)?;
        Ok(true)
    }

    /// Copy the best snapshot back into the live variables.
    pub fn restore(&self, varmap: &VarMap) -> Result<()> {
        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            match self.snapshot.get(name) {
                Some(value) => var.set(value)?,
                None => candle::bail!("checkpoint snapshot has no variable named {name}"),
            }
        }
        Ok(())
    }
}

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap.data().lock().unwrap();
    let mut snapshot = HashMap::with_capacity(data.len());
    for (name, var) in data.iter() {
        snapshot.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(snapshot)
}

/// Write every variable to a safetensors file, creating parent directories.
pub fn save(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(candle::Error::wrap)?;
    }
    varmap.save(path)
}

/// Load a safetensors file written by [`save`] into existing variables.
pub fn load(varmap: &mut VarMap, path: &Path) -> Result<()> {
    tracing::info!(path = %path.display(), "Loading weights");
    varmap.load(path)
}
