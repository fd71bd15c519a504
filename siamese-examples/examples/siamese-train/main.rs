// Trains a quasi-siamese network on synthetic "changed patch" pairs and
// evaluates the best checkpoint on a held-out split.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::{Path, PathBuf};

use anyhow::Result;
use candle::Device;
use clap::{Args, Parser, Subcommand};
use rand::prelude::*;
use siamese_light::{
    adam, runs, PairDataset, PairLoader, PairModule, PredictionWriter, RunConfig, SiameseNetwork,
    Trainer,
};

#[derive(Parser, Debug)]
#[command(
    name = "siamese-train",
    about = "Train and test a quasi-siamese image comparison network"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, keeping the weights with the best validation accuracy.
    Train(RunArgs),
    /// Evaluate the saved best weights of a run on the test split.
    Test(RunArgs),
    /// List the runs under the output directory that have test predictions.
    List {
        #[arg(long, default_value = "runs")]
        output_directory: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON run configuration; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    number_of_epochs: Option<usize>,
    #[arg(long)]
    model_name: Option<String>,
    #[arg(long, default_value = "runs")]
    output_directory: PathBuf,
    /// Number of synthetic pairs per split: train gets 8 parts, validation and test 1 each.
    #[arg(long, default_value = "100")]
    dataset_size: usize,
    #[arg(long, default_value = "299792458")]
    seed: u64,
    /// Run on the CPU even when an accelerator is available.
    #[arg(long)]
    cpu: bool,
}

impl RunArgs {
    fn run_config(&self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.input_size {
            cfg.input_size = v;
        }
        if let Some(v) = self.learning_rate {
            cfg.learning_rate = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.number_of_epochs {
            cfg.number_of_epochs = v;
        }
        if let Some(v) = &self.model_name {
            cfg.model_name = v.clone();
        }
        Ok(cfg)
    }
}

struct Splits {
    train: PairDataset,
    validation: PairDataset,
    test: PairDataset,
}

fn create_splits(args: &RunArgs, input_size: usize, dev: &Device) -> Result<Splits> {
    // Each split draws from its own seeded stream so `test` sees the same pairs as after `train`.
    let split = |n: usize, offset: u64| -> Result<PairDataset> {
        let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(offset));
        Ok(PairDataset::synthetic(n, input_size, &mut rng, dev)?)
    };
    Ok(Splits {
        train: split(args.dataset_size * 8, 0)?,
        validation: split(args.dataset_size, 1)?,
        test: split(args.dataset_size, 2)?,
    })
}

fn build_trainer(
    cfg: &RunConfig,
    run_dir: &Path,
    dev: &Device,
) -> Result<Trainer<SiameseNetwork, candle_nn::AdamW>> {
    let model = SiameseNetwork::new(cfg.input_size, cfg.dropout, dev)?;
    tracing::debug!("Num params: {}", model.parameters().len());
    let optimizer = adam(model.parameters(), cfg.learning_rate)?;
    let trainer = Trainer::new(model, optimizer, cfg.trainer_config(dev.clone()))
        .with_callback(PredictionWriter::for_run(run_dir));
    Ok(trainer)
}

fn train(args: &RunArgs) -> Result<()> {
    let cfg = args.run_config()?;
    let dev = siamese_examples::device(args.cpu)?;
    tracing::info!("Using device: {:?}", dev);

    let run_dir = args.output_directory.join(cfg.run_directory_name());
    cfg.save(&run_dir.join(runs::CONFIG_FILE))?;

    let splits = create_splits(args, cfg.input_size, &dev)?;
    tracing::info!(
        train = splits.train.len(),
        validation = splits.validation.len(),
        "Loaded synthetic pairs"
    );
    let mut train_data =
        PairLoader::shuffled(splits.train, cfg.batch_size, StdRng::seed_from_u64(args.seed));
    let mut validation_data = PairLoader::sequential(splits.validation, cfg.batch_size);

    let mut trainer = build_trainer(&cfg, &run_dir, &dev)?;
    let report = trainer.train(
        cfg.number_of_epochs,
        &mut train_data,
        &mut validation_data,
        run_dir.join(runs::CHECKPOINT_FILE),
    )?;
    match report.best_epoch {
        Some(epoch) => println!(
            "best validation accuracy {:.4} at epoch {epoch}, weights in {}",
            report.best_accuracy,
            run_dir.display()
        ),
        None => println!("validation accuracy never rose above zero, no checkpoint written"),
    }
    Ok(())
}

fn test(args: &RunArgs) -> Result<()> {
    let cfg = args.run_config()?;
    let run_dir = args.output_directory.join(cfg.run_directory_name());
    // A saved run config wins over defaults so the network is rebuilt with the trained shape.
    let cfg = match (&args.config, run_dir.join(runs::CONFIG_FILE)) {
        (None, path) if path.exists() => RunConfig::load(&path)?,
        _ => cfg,
    };
    let dev = siamese_examples::device(args.cpu)?;

    let splits = create_splits(args, cfg.input_size, &dev)?;
    let mut test_data = PairLoader::sequential(splits.test, cfg.batch_size);

    let mut trainer = build_trainer(&cfg, &run_dir, &dev)?;
    let output = trainer.test(run_dir.join(runs::CHECKPOINT_FILE), &mut test_data)?;
    println!("test loss {:.4} accuracy {:.4}", output.loss, output.accuracy);
    Ok(())
}

fn list(output_directory: &Path) -> Result<()> {
    for run in runs::list_runs(output_directory)? {
        println!(
            "{} input_size={} learning_rate={} batch_size={} test={} validation={}",
            run.model_name,
            run.input_size,
            run.learning_rate,
            run.batch_size,
            run.test_predictions.len(),
            run.validation_predictions.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Train(args) => train(args),
        Command::Test(args) => test(args),
        Command::List { output_directory } => list(output_directory),
    }
}
