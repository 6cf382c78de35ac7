use std::path::PathBuf;

use burn::backend::NdArray;
use clap::Parser;
use image::DynamicImage;
use log::LevelFilter;

use cell_segmentation::data::{overlay, write_submission, CellDataset, Submission};
use cell_segmentation::inference::{InferenceEngine, InstanceDecoder};
use cell_segmentation::training::{load_model, TrainingConfig};
use cell_segmentation::types::Image;

#[derive(Parser, Debug)]
#[command(author, version, about = "Segment cell images with a trained network")]
struct Args {
    /// Config saved next to the checkpoints of a run
    #[arg(short, long)]
    config: String,

    /// Model record (path without `.bin`)
    #[arg(short = 'w', long)]
    checkpoint: PathBuf,

    /// A single image to segment
    #[arg(short, long, conflicts_with = "test_dir")]
    image: Option<PathBuf>,

    /// Directory in the `<id>/images/<id>.png` layout; writes a submission
    #[arg(short, long)]
    test_dir: Option<String>,

    #[arg(short, long, default_value = "runs/infer")]
    output: PathBuf,

    /// Overrides the configured foreground cutoff
    #[arg(long)]
    cutoff: Option<f32>,

    /// Split touching objects using confident cores
    #[arg(long)]
    separator: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder().filter_level(LevelFilter::Info).init();
    let args = Args::parse();

    type MyBackend = NdArray;
    let device = Default::default();

    let mut config = TrainingConfig::from_yaml(&args.config)?;
    if let Some(cutoff) = args.cutoff {
        config.inference.cutoff = cutoff;
    }
    config.inference.use_separator |= args.separator;

    let network = config.network.model.build::<MyBackend>(&config.network, &device)?;
    let network = load_model(network, &args.checkpoint, &device)?;
    log::info!("restored from checkpoint, {}", args.checkpoint.display());

    let engine = InferenceEngine::from_config(&config.inference)?;
    let decoder = InstanceDecoder::from_config(&config.inference);

    if let Some(test_dir) = &args.test_dir {
        let dataset = CellDataset::open_test(test_dir, config.network.color)?;
        let flows = config.network.model.input_flow(&config.network);
        let path = write_submission(&network, &dataset, &flows.test, &engine, &decoder, &args.output)?;
        println!("Submission: {}", path.display());
        return Ok(());
    }

    let Some(image_path) = &args.image else {
        anyhow::bail!("either --image or --test-dir is required");
    };
    let decoded = image::open(image_path)?;
    let image = Image::from_dynamic(&decoded, config.network.color)?;
    let (h, w) = (image.height(), image.width());
    println!("Image: {} ({}x{})", image_path.display(), w, h);

    let start = std::time::Instant::now();
    let prepared = config.network.model.preprocess(&config.network, &image)?;
    let instances: Vec<_> = config
        .network
        .model
        .inference(&network, &engine, &decoder, &prepared)?
        .iter()
        .map(|m| m.resize(w as u32, h as u32))
        .filter(|m| !m.is_empty())
        .collect();
    println!("Inference completed in {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
    println!("Found {} instances", instances.len());
    for (i, instance) in instances.iter().enumerate() {
        if let Some(b) = instance.bounds() {
            println!(
                "  {}. area={} box=({}, {})-({}, {})",
                i + 1,
                instance.area(),
                b.x0,
                b.y0,
                b.x1,
                b.y1
            );
        }
    }

    let id = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "image".to_string());
    let mut submission = Submission::new(&args.output)?;
    let saved = submission.save_image(&id, &DynamicImage::ImageRgb8(overlay(&image, &instances)))?;
    submission.add_result(&id, &instances);
    let csv = submission.save()?;
    println!("Saved {} and {}", saved.display(), csv.display());
    Ok(())
}
