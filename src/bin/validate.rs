use std::path::PathBuf;

use burn::backend::NdArray;
use clap::Parser;
use log::LevelFilter;
use rand::rngs::StdRng;
use rand::SeedableRng;

use cell_segmentation::data::CellDataset;
use cell_segmentation::inference::{InferenceEngine, InstanceDecoder};
use cell_segmentation::training::{
    load_model, score, Evaluator, MetricPool, ThresholdList, TrainingConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Score a trained network with the IoU matching metric")]
struct Args {
    /// Config saved next to the checkpoints of a run
    #[arg(short, long)]
    config: String,

    /// Model record (path without `.bin`)
    #[arg(short = 'w', long)]
    checkpoint: PathBuf,

    /// Score every image of this directory instead of the validation split
    #[arg(short, long)]
    data: Option<String>,

    /// Score a single image id and print per-threshold counts
    #[arg(long)]
    id: Option<String>,

    /// Save every scored image with its predictions drawn over it
    #[arg(long)]
    save_images: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();
    let args = Args::parse();

    type MyBackend = NdArray;
    let device = Default::default();

    let config = TrainingConfig::from_yaml(&args.config)?;
    let network = config.network.model.build::<MyBackend>(&config.network, &device)?;
    let network = load_model(network, &args.checkpoint, &device)?;
    log::info!("restored from checkpoint, {}", args.checkpoint.display());

    let dataset = match &args.data {
        Some(dir) => CellDataset::open(dir, config.network.color)?,
        None => {
            let all = CellDataset::open(&config.train_dir, config.network.color)?;
            all.split(config.valid_fraction, config.seed)?.1
        }
    };

    let thresholds = ThresholdList::new(config.thresholds.clone())?;
    let engine = InferenceEngine::from_config(&config.inference)?;
    let decoder = InstanceDecoder::from_config(&config.inference);
    let flows = config.network.model.input_flow(&config.network);

    if let Some(id) = &args.id {
        let idx = dataset
            .position(id)
            .ok_or_else(|| anyhow::anyhow!("image {} not found", id))?;
        let sample = dataset.get(idx)?;
        let (h, w) = sample.size();
        log::info!("image size=({} x {})", w, h);

        let sample = flows.valid_full.augment(sample, &mut StdRng::seed_from_u64(0))?;
        let merged = engine.infer(&network, &sample.image)?;
        let instances = decoder.decode(&merged);
        let counts = score(&thresholds, &instances, &sample.masks);

        println!("instances={}, labels={}", instances.len(), sample.masks.len());
        for (i, thr) in thresholds.as_slice().iter().enumerate() {
            let (tp, fp, fn_) = (
                counts.true_positives[i],
                counts.false_positives[i],
                counts.false_negatives[i],
            );
            let total = (tp + fp + fn_).max(1);
            println!(
                "score={:.3}, tp={}, fp={}, fn={} --- iou {:.2}",
                tp as f64 / total as f64,
                tp,
                fp,
                fn_,
                thr
            );
        }
        match counts.image_score() {
            Some(s) => println!("score={:.3} --- mean", s),
            None => println!("no instances and no labels"),
        }
        return Ok(());
    }

    let pool = MetricPool::new(config.metric_workers, thresholds)?;
    let evaluator = Evaluator {
        pool: &pool,
        engine,
        decoder,
        pipeline: flows.valid_full,
        image_dir: args.save_images.clone(),
    };
    let report = evaluator.evaluate(&network, &dataset);

    for result in &report.per_image {
        match result.score {
            Some(s) => println!("{}: score={:.3}", result.id, s),
            None => println!("{}: -", result.id),
        }
    }
    println!();
    println!("Images: {} ({} skipped)", report.evaluated(), report.skipped);
    println!("Mean image score: {:.4}", report.mean_image_score().unwrap_or(0.0));
    println!("mIoU: {:.4}", report.mean_iou().unwrap_or(0.0));
    Ok(())
}
