//! Train, validate and test quasi-siamese image-comparison networks with Candle.
//!
//! A [`Trainer`] owns a [`PairModule`], an optimiser, a plateau learning-rate
//! scheduler and a loss function. [`Trainer::train`] alternates train and
//! validation phases and keeps the weights of the most accurate validation
//! epoch on disk; [`Trainer::test`] reloads them for a final evaluation pass.

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod metrics;
pub mod module;
pub mod network;
pub mod phase;
pub mod runs;
pub mod scheduler;
pub mod trainer;

pub use callbacks::{Callback, PredictionWriter};
pub use checkpoint::BestCheckpoint;
pub use config::{RunConfig, TrainerConfig};
pub use data::{BatchSource, PairBatch, PairDataset, PairLoader};
pub use metrics::{ClosenessAccuracy, EpochMetrics, Metric};
pub use module::PairModule;
pub use network::SiameseNetwork;
pub use phase::Phase;
pub use runs::{Prediction, RunSummary};
pub use scheduler::ReduceLrOnPlateau;
pub use trainer::{adam, Criterion, EpochRecord, PhaseOutput, StepOutput, TrainReport, Trainer};
