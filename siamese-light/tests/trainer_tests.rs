#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarMap};
use rand::prelude::*;
use siamese_light::{
    adam, runs, BatchSource, Callback, EpochRecord, PairBatch, PairDataset, PairLoader, PairModule,
    Phase, PhaseOutput, PredictionWriter, SiameseNetwork, StepOutput, Trainer, TrainerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const INPUT_SIZE: usize = 8;

fn synthetic(n: usize, seed: u64) -> Result<PairDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(PairDataset::synthetic(n, INPUT_SIZE, &mut rng, &Device::Cpu)?)
}

fn trainer(threshold: f64, lr: f64) -> Result<Trainer<SiameseNetwork, candle_nn::AdamW>> {
    let model = SiameseNetwork::new(INPUT_SIZE, 0.0, &Device::Cpu)?;
    let optimizer = adam(model.parameters(), lr)?;
    let config = TrainerConfig::new()
        .log_every_n_steps(0)
        .accuracy_threshold(threshold);
    Ok(Trainer::new(model, optimizer, config))
}

fn weights(varmap: &VarMap) -> Result<Vec<(String, Vec<f32>)>> {
    let data = varmap.data().lock().unwrap();
    let mut out = Vec::new();
    for (name, var) in data.iter() {
        out.push((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[test]
fn identical_pairs_converge_to_zero_loss() -> Result<()> {
    let device = Device::Cpu;
    let image = Tensor::rand(0f32, 1., (4, 3, INPUT_SIZE, INPUT_SIZE), &device)?;
    let batches = vec![PairBatch {
        left: image.clone(),
        right: image,
        labels: Tensor::zeros(4, DType::F32, &device)?,
        ids: (0..4).map(|i| format!("same-{i}")).collect(),
    }];

    let mut trainer = trainer(0.01, 0.05)?;
    for epoch in 0..150 {
        trainer.run_epoch(epoch, Phase::Train, &batches)?;
    }
    let eval = trainer.run_epoch(150, Phase::Validation, &batches)?;

    assert!(eval.loss < 1e-3, "loss did not converge: {}", eval.loss);
    Ok(())
}

#[test]
fn evaluation_phases_leave_weights_untouched() -> Result<()> {
    let batches = synthetic(8, 1)?.sequential_batches(4)?;
    let mut trainer = trainer(0.01, 0.01)?;

    let before = weights(trainer.model().varmap())?;
    trainer.run_epoch(0, Phase::Validation, &batches)?;
    trainer.run_epoch(0, Phase::Test, &batches)?;
    assert_eq!(before, weights(trainer.model().varmap())?);
    assert!(!trainer.model().is_training());

    trainer.run_epoch(0, Phase::Train, &batches)?;
    assert_ne!(before, weights(trainer.model().varmap())?);
    assert!(trainer.model().is_training());
    Ok(())
}

#[test]
fn epoch_metrics_stay_in_range() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut train = PairLoader::shuffled(synthetic(16, 2)?, 4, StdRng::seed_from_u64(0));
    let mut validation = PairLoader::sequential(synthetic(8, 3)?, 4);

    let mut trainer = trainer(0.1, 0.01)?;
    let save_path = dir.path().join("best.safetensors");
    let report = trainer.train(5, &mut train, &mut validation, save_path)?;

    assert_eq!(report.history.len(), 5);
    for record in &report.history {
        for acc in [record.train_accuracy, record.validation_accuracy] {
            assert!((0.0..=1.0).contains(&acc), "accuracy out of range: {acc}");
        }
        assert!(record.train_loss >= 0.0);
        assert!(record.validation_loss >= 0.0);
    }
    Ok(())
}

#[test]
fn checkpoint_saved_iff_validation_accuracy_strictly_improves() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let save_path = dir.path().join("best.safetensors");
    let mut train = PairLoader::shuffled(synthetic(24, 4)?, 8, StdRng::seed_from_u64(1));
    let mut validation = PairLoader::sequential(synthetic(12, 5)?, 4);

    let mut trainer = trainer(0.1, 0.01)?;
    let report = trainer.train(8, &mut train, &mut validation, &save_path)?;

    let mut best = 0.0;
    for record in &report.history {
        let improved = record.validation_accuracy > best;
        assert_eq!(record.checkpointed, improved, "epoch {}", record.epoch);
        if improved {
            best = record.validation_accuracy;
        }
    }
    assert_eq!(report.best_accuracy, best);
    assert_eq!(save_path.exists(), report.history.iter().any(|r| r.checkpointed));
    Ok(())
}

#[test]
fn test_reproduces_best_epoch_metrics() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let save_path = dir.path().join("best.safetensors");
    let mut train = PairLoader::shuffled(synthetic(16, 6)?, 4, StdRng::seed_from_u64(2));
    let validation_set = synthetic(8, 7)?;
    let mut validation = PairLoader::sequential(validation_set.clone(), 4);

    // Scores and labels both live in [0, 1], so a threshold of 1 makes every
    // epoch fully accurate: epoch 0 is saved and later ties are not.
    let mut trainer = trainer(1.0, 0.01)?;
    let report = trainer.train(4, &mut train, &mut validation, &save_path)?;
    assert_eq!(report.best_epoch, Some(0));
    assert_eq!(
        report.history.iter().filter(|r| r.checkpointed).count(),
        1
    );

    let best = &report.history[0];
    let mut test_data = PairLoader::sequential(validation_set, 4);
    let tested = trainer.test(&save_path, &mut test_data)?;
    assert_eq!(tested.phase, Phase::Test);
    assert!((tested.loss - best.validation_loss).abs() < 1e-6);
    assert_eq!(tested.accuracy, best.validation_accuracy);
    Ok(())
}

#[test]
fn restore_best_matches_saved_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let save_path = dir.path().join("best.safetensors");
    let mut train = synthetic(8, 8)?.sequential_batches(4)?;
    let mut validation = synthetic(4, 9)?.sequential_batches(4)?;

    let mut trainer = trainer(1.0, 0.05)?;
    trainer.train(3, &mut train, &mut validation, &save_path)?;
    trainer.restore_best()?;
    let restored = weights(trainer.model().varmap())?;

    let mut reloaded = SiameseNetwork::new(INPUT_SIZE, 0.0, &Device::Cpu)?;
    reloaded.varmap_mut().load(&save_path)?;
    assert_eq!(restored, weights(reloaded.varmap())?);
    Ok(())
}

#[test]
fn empty_phase_is_an_error() -> Result<()> {
    let mut trainer = trainer(0.01, 0.01)?;
    assert!(trainer.run_epoch(0, Phase::Validation, &[]).is_err());

    let dir = tempfile::tempdir()?;
    let mut train = synthetic(4, 10)?.sequential_batches(4)?;
    let mut validation: Vec<PairBatch> = Vec::new();
    let result = trainer.train(1, &mut train, &mut validation, dir.path().join("best.safetensors"));
    assert!(result.is_err());
    Ok(())
}

#[test]
fn learning_rate_only_decreases_down_to_floor() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut train = synthetic(8, 11)?.sequential_batches(4)?;
    let mut validation = synthetic(4, 12)?.sequential_batches(4)?;

    let model = SiameseNetwork::new(INPUT_SIZE, 0.0, &Device::Cpu)?;
    let optimizer = adam(model.parameters(), 1e-3)?;
    let config = TrainerConfig::new()
        .log_every_n_steps(0)
        .lr_patience(0)
        .min_lr(1e-4);
    let mut trainer = Trainer::new(model, optimizer, config);
    let save_path = dir.path().join("best.safetensors");
    let report = trainer.train(12, &mut train, &mut validation, save_path)?;

    let mut previous = 1e-3;
    for record in &report.history {
        assert!(record.learning_rate <= previous);
        assert!(record.learning_rate >= 1e-4 - 1e-12);
        previous = record.learning_rate;
    }
    assert_eq!(trainer.optimizer().learning_rate(), trainer.scheduler().learning_rate());
    Ok(())
}

struct CountingCallback {
    epoch_starts: Arc<AtomicUsize>,
    epoch_ends: Arc<AtomicUsize>,
    batch_ends: Arc<AtomicUsize>,
    phases: Arc<Mutex<Vec<(Phase, usize)>>>,
}

impl Callback for CountingCallback {
    fn on_epoch_start(&mut self, _epoch: usize) -> candle::Result<()> {
        self.epoch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_epoch_end(&mut self, _record: &EpochRecord) -> candle::Result<()> {
        self.epoch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> candle::Result<()> {
        self.batch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_phase_end(&mut self, output: &PhaseOutput) -> candle::Result<()> {
        self.phases.lock().unwrap().push((output.phase, output.epoch));
        Ok(())
    }
}

#[test]
fn trainer_callback_invocation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut train = synthetic(8, 13)?.sequential_batches(4)?;
    let mut validation = synthetic(4, 14)?.sequential_batches(4)?;

    let epoch_starts = Arc::new(AtomicUsize::new(0));
    let epoch_ends = Arc::new(AtomicUsize::new(0));
    let batch_ends = Arc::new(AtomicUsize::new(0));
    let phases = Arc::new(Mutex::new(Vec::new()));
    let callback = CountingCallback {
        epoch_starts: epoch_starts.clone(),
        epoch_ends: epoch_ends.clone(),
        batch_ends: batch_ends.clone(),
        phases: phases.clone(),
    };

    let mut trainer = trainer(0.01, 0.01)?.with_callback(callback);
    trainer.train(3, &mut train, &mut validation, dir.path().join("best.safetensors"))?;

    assert_eq!(epoch_starts.load(Ordering::SeqCst), 3);
    assert_eq!(epoch_ends.load(Ordering::SeqCst), 3);
    assert_eq!(batch_ends.load(Ordering::SeqCst), 6); // 2 batches * 3 epochs
    assert_eq!(
        *phases.lock().unwrap(),
        vec![
            (Phase::Train, 0),
            (Phase::Validation, 0),
            (Phase::Train, 1),
            (Phase::Validation, 1),
            (Phase::Train, 2),
            (Phase::Validation, 2),
        ]
    );
    Ok(())
}

#[test]
fn prediction_files_are_listed_as_a_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let run_name = runs::run_directory_name("toy", INPUT_SIZE, 0.01, 4);
    let run_dir = root.path().join(&run_name);
    let save_path = run_dir.join(runs::CHECKPOINT_FILE);

    let mut train = synthetic(8, 15)?.sequential_batches(4)?;
    let validation_set = synthetic(6, 16)?;
    let mut validation = validation_set.sequential_batches(4)?;

    let mut trainer = trainer(1.0, 0.01)?.with_callback(PredictionWriter::for_run(&run_dir));
    trainer.train(2, &mut train, &mut validation, &save_path)?;
    trainer.test(&save_path, &mut validation_set.sequential_batches(4)?)?;

    let found = runs::list_runs(root.path())?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].model_name, "toy");
    assert_eq!(found[0].test_predictions, vec!["test-epoch-000.txt"]);
    assert_eq!(
        found[0].validation_predictions,
        vec!["validation-epoch-000.txt", "validation-epoch-001.txt"]
    );

    let preds = runs::read_predictions(
        &run_dir
            .join(runs::PREDICTIONS_DIR)
            .join(runs::prediction_file_name(Phase::Test, 0)),
    )?;
    assert_eq!(preds.len(), 6);
    assert_eq!(preds[0].id, "pair-00000");
    assert!(preds.iter().all(|p| (0.0..=1.0).contains(&p.score)));
    Ok(())
}

#[test]
fn batch_sources_are_replayed_each_epoch() -> Result<()> {
    let mut source = synthetic(6, 17)?.sequential_batches(4)?;
    let first: Vec<_> = source.batches(0)?.into_iter().map(|b| b.ids).collect();
    let second: Vec<_> = source.batches(1)?.into_iter().map(|b| b.ids).collect();
    assert_eq!(first, second);
    Ok(())
}

fn batch_with(labels: Tensor, ids: Vec<String>) -> Result<PairBatch> {
    let device = Device::Cpu;
    Ok(PairBatch {
        left: Tensor::rand(0f32, 1., (4, 3, INPUT_SIZE, INPUT_SIZE), &device)?,
        right: Tensor::rand(0f32, 1., (4, 3, INPUT_SIZE, INPUT_SIZE), &device)?,
        labels,
        ids,
    })
}

#[test]
fn integer_and_double_labels_are_cast_to_score_dtype() -> Result<()> {
    let ids: Vec<String> = (0..4).map(|i| format!("pair-{i}")).collect();
    let bytes = batch_with(Tensor::new(&[0u8, 1, 0, 1], &Device::Cpu)?, ids.clone())?;
    let doubles = batch_with(Tensor::new(&[0f64, 1., 0., 1.], &Device::Cpu)?, ids)?;

    let mut trainer = trainer(0.01, 0.01)?;
    for batch in [bytes, doubles] {
        let batches = vec![batch];
        let output = trainer.run_epoch(0, Phase::Validation, &batches)?;
        let labels: Vec<f32> = output.predictions.iter().map(|p| p.label).collect();
        assert_eq!(labels, vec![0.0, 1.0, 0.0, 1.0]);
        assert!(output.loss.is_finite());
        trainer.run_epoch(0, Phase::Train, &batches)?;
    }
    Ok(())
}

#[test]
fn batch_ids_must_match_examples() -> Result<()> {
    let labels = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
    let batches = vec![batch_with(labels, vec!["only-one".to_string()])?];

    let mut trainer = trainer(0.01, 0.01)?;
    let before = weights(trainer.model().varmap())?;
    assert!(trainer.run_epoch(0, Phase::Test, &batches).is_err());
    assert!(trainer.run_epoch(0, Phase::Train, &batches).is_err());
    assert_eq!(before, weights(trainer.model().varmap())?);
    Ok(())
}
