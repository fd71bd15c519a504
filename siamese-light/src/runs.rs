//! Run directories and prediction files.
//!
//! Every training run lives in its own directory under a models root:
//!
//! ```text
//! models/
//!   quasi-siamese-input_size_32-learning_rate_0.001-batch_size_32/
//!     best_model_wts.safetensors
//!     run_config.json
//!     predictions/
//!       validation-epoch-000.txt
//!       test-epoch-000.txt
//! ```
//!
//! Prediction files hold one `id label score` line per example.

use crate::Phase;
use candle::Result;
use std::io::Write;
use std::path::Path;

pub const CHECKPOINT_FILE: &str = "best_model_wts.safetensors";
pub const CONFIG_FILE: &str = "run_config.json";
pub const PREDICTIONS_DIR: &str = "predictions";

const INPUT_SIZE_PREFIX: &str = "input_size_";
const LEARNING_RATE_PREFIX: &str = "learning_rate_";
const BATCH_SIZE_PREFIX: &str = "batch_size_";

pub fn run_directory_name(
    model_name: &str,
    input_size: usize,
    learning_rate: f64,
    batch_size: usize,
) -> String {
    format!(
        "{model_name}-{INPUT_SIZE_PREFIX}{input_size}-{LEARNING_RATE_PREFIX}{learning_rate}-\
         {BATCH_SIZE_PREFIX}{batch_size}"
    )
}

pub fn prediction_file_name(phase: Phase, epoch: usize) -> String {
    format!("{phase}-epoch-{epoch:03}.txt")
}

/// A past run found under a models root.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub model_name: String,
    pub directory: String,
    pub input_size: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub test_predictions: Vec<String>,
    pub validation_predictions: Vec<String>,
}

/// Splits a run directory name back into `(model_name, input_size,
/// learning_rate, batch_size)`. The model name itself may contain dashes.
pub fn parse_run_directory(name: &str) -> Option<(String, usize, f64, usize)> {
    let mut parts = name.rsplitn(4, '-');
    let batch_size = parts.next()?.strip_prefix(BATCH_SIZE_PREFIX)?.parse().ok()?;
    let learning_rate = parts.next()?.strip_prefix(LEARNING_RATE_PREFIX)?.parse().ok()?;
    let input_size = parts.next()?.strip_prefix(INPUT_SIZE_PREFIX)?.parse().ok()?;
    let model_name = parts.next().filter(|n| !n.is_empty())?;
    Some((model_name.to_string(), input_size, learning_rate, batch_size))
}

/// Lists the runs under `root` that have at least one test prediction file,
/// sorted by directory name. Entries whose name does not parse are skipped.
pub fn list_runs(root: &Path) -> Result<Vec<RunSummary>> {
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(root).map_err(candle::Error::wrap)? {
        let entry = entry.map_err(candle::Error::wrap)?;
        let directory = entry.file_name().to_string_lossy().into_owned();
        let Some((model_name, input_size, learning_rate, batch_size)) =
            parse_run_directory(&directory)
        else {
            tracing::debug!(%directory, "Skipping unrecognised run directory");
            continue;
        };

        let Ok(files) = std::fs::read_dir(entry.path().join(PREDICTIONS_DIR)) else {
            continue;
        };
        let mut filenames = Vec::new();
        for file in files {
            let file = file.map_err(candle::Error::wrap)?;
            filenames.push(file.file_name().to_string_lossy().into_owned());
        }
        filenames.sort();

        let test_predictions: Vec<String> = filenames
            .iter()
            .filter(|f| f.contains(Phase::Test.as_str()))
            .cloned()
            .collect();
        if test_predictions.is_empty() {
            continue;
        }
        let validation_predictions = filenames
            .into_iter()
            .filter(|f| f.contains(Phase::Validation.as_str()))
            .collect();

        runs.push(RunSummary {
            model_name,
            directory,
            input_size,
            learning_rate,
            batch_size,
            test_predictions,
            validation_predictions,
        });
    }
    runs.sort_by(|a, b| a.directory.cmp(&b.directory));
    Ok(runs)
}

/// One scored example.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub label: f32,
    pub score: f32,
}

pub fn write_predictions(path: &Path, predictions: &[Prediction]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(candle::Error::wrap)?;
    }
    let file = std::fs::File::create(path).map_err(candle::Error::wrap)?;
    let mut out = std::io::BufWriter::new(file);
    for p in predictions {
        writeln!(out, "{} {:.4} {:.4}", p.id, p.label, p.score).map_err(candle::Error::wrap)?;
    }
    out.flush().map_err(candle::Error::wrap)
}

pub fn read_predictions(path: &Path) -> Result<Vec<Prediction>> {
    let s = std::fs::read_to_string(path).map_err(candle::Error::wrap)?;
    s.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| -> Result<Prediction> {
            let mut fields = line.split_whitespace();
            let (Some(id), Some(label), Some(score), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                candle::bail!("{}:{}: expected `id label score`", path.display(), idx + 1)
            };
            Ok(Prediction {
                id: id.to_string(),
                label: label.parse().map_err(candle::Error::wrap)?,
                score: score.parse().map_err(candle::Error::wrap)?,
            })
        })
        .collect()
}
