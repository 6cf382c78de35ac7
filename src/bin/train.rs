use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use clap::Parser;
use log::LevelFilter;

use cell_segmentation::data::{write_submission, CellDataset};
use cell_segmentation::inference::{InferenceEngine, InstanceDecoder};
use cell_segmentation::model::ModelKind;
use cell_segmentation::training::{
    load_model, run_name, BestCheckpointSaver, Trainer, TrainingConfig, TrainingState,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a U-Net for cell instance segmentation")]
struct Args {
    /// Training config (created with defaults when missing)
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: String,

    /// Overrides the configured model
    #[arg(short, long)]
    model: Option<ModelKind>,

    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Abandon runs that stop improving
    #[arg(long)]
    early_rejection: bool,

    /// Prefix of the run directory name
    #[arg(short, long)]
    tag: Option<String>,

    /// Initial weights saved by a previous run (path without `.bin`)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

/// Ctrl-C ends training after the current epoch; a second one exits at once.
fn watch_interrupt(state: Arc<TrainingState>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        if state.should_stop() {
            log::warn!("interrupted again, exiting without final validation");
            std::process::exit(130);
        }
        state.request_stop();
    })?;
    Ok(())
}

/// Typing `stop` on stdin ends training after the current epoch.
fn watch_stdin(state: Arc<TrainingState>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim() == "stop" => {
                    state.request_stop();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();
    let args = Args::parse();

    type MyBackend = NdArray;
    type MyAutodiffBackend = Autodiff<MyBackend>;
    let device = Default::default();

    let mut config = if Path::new(&args.config).exists() {
        log::info!("loading config from {}", args.config);
        TrainingConfig::from_yaml(&args.config)?
    } else {
        let config = TrainingConfig::default();
        if let Some(parent) = Path::new(&args.config).parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&args.config)?;
        log::info!("created default config at {}", args.config);
        config
    };
    if let Some(model) = args.model {
        config.network.model = model;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    config.early_rejection |= args.early_rejection;
    config.validate()?;

    let name = run_name(&config, args.tag.as_deref());
    let run_dir = Path::new(&config.save_dir).join(&name);
    std::fs::create_dir_all(&run_dir)?;
    config.save(&run_dir.join("config.yaml").to_string_lossy())?;

    println!("Training configuration:");
    println!("  Run: {}", name);
    println!("  Model: {} (patch {})", config.network.model, config.network.patch_size());
    println!("  Epochs: {}", config.epochs);
    println!("  Batch size: {}", config.batch_size);
    println!("  Learning rate: {}", config.learning_rate);
    println!("  Data: {}", config.train_dir);
    println!();

    let dataset = CellDataset::open(&config.train_dir, config.network.color)
        .with_context(|| format!("opening {}", config.train_dir))?;
    let (train, valid) = dataset.split(config.valid_fraction, config.seed)?;

    let mut trainer = match &args.checkpoint {
        Some(path) => {
            let model = config.network.model.build(&config.network, &device)?;
            let model = load_model(model, path, &device)?;
            log::info!("restored from checkpoint, {}", path.display());
            Trainer::<MyAutodiffBackend>::with_model(config.clone(), model, device)
        }
        None => Trainer::<MyAutodiffBackend>::new(config.clone(), device)?,
    };
    trainer.set_valid_image_dir(run_dir.join("valid"));
    watch_interrupt(trainer.state())?;
    watch_stdin(trainer.state());
    println!("Press Ctrl-C or type `stop` and press enter to end training early.\n");

    let mut store = BestCheckpointSaver::new(run_dir.join("model"), config.num_to_keep)?;
    let outcome = trainer.train(train, valid, &mut store)?;

    println!();
    println!("Epochs: {}", outcome.epochs);
    println!("Best mIoU: {:.4}", outcome.best_score);
    if let Some(score) = outcome.final_report.mean_image_score() {
        println!("Final validation score: {:.4}", score);
    }

    if let Some(test_dir) = &config.test_dir {
        let test = CellDataset::open_test(test_dir, config.network.color)?;
        let flows = config.network.model.input_flow(&config.network);
        let path = write_submission(
            &trainer.model.valid(),
            &test,
            &flows.test,
            &InferenceEngine::from_config(&config.inference)?,
            &InstanceDecoder::from_config(&config.inference),
            &run_dir.join("submission"),
        )?;
        println!("Submission: {}", path.display());
    }

    println!("Checkpoints saved in: {}", run_dir.display());
    Ok(())
}
