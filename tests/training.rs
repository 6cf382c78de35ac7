mod common;

use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};

use cell_segmentation::data::{CellDataset, PrefetchLoader};
use cell_segmentation::model::ModelKind;
use cell_segmentation::training::{
    BestCheckpointSaver, CheckpointStore, NetworkConfig, Trainer, TrainingConfig,
};

type TestBackend = Autodiff<NdArray>;

fn tiny_config(train_dir: &str, save_dir: &str) -> TrainingConfig {
    TrainingConfig {
        train_dir: train_dir.to_string(),
        save_dir: save_dir.to_string(),
        valid_fraction: 0.34,
        network: NetworkConfig {
            model: ModelKind::SimpleUnet,
            patch_size: Some(16),
            stage_count: 2,
            base_width: 4,
            ..NetworkConfig::default()
        },
        epochs: 2,
        batch_size: 2,
        learning_rate: 1e-3,
        loader_workers: 2,
        prefetch: 2,
        valid_interval: 1,
        valid_repeats: 1,
        loss_gate: 100.0,
        metric_gate: 100.0,
        metric_min_epoch: 0,
        metric_workers: 2,
        ..TrainingConfig::default()
    }
}

#[test]
fn loader_yields_every_sample_once() {
    let tmp = tempfile::tempdir().unwrap();
    common::write_dataset(tmp.path(), 5, 24);
    let dataset = Arc::new(CellDataset::open(tmp.path(), true).unwrap());
    let flows = ModelKind::SimpleUnet.input_flow(&NetworkConfig {
        patch_size: Some(16),
        ..NetworkConfig::default()
    });

    let loader = PrefetchLoader::new(dataset, flows.train, 2, 3, 1, 9);
    assert_eq!(loader.len(), 3);
    let batches: Vec<_> = loader.collect();
    assert_eq!(batches.iter().map(|b| b.count).sum::<usize>(), 5);
    assert!(batches.iter().all(|b| b.patch_size == 16 && b.weights.is_some()));
}

#[test]
fn dropping_a_loader_early_does_not_hang() {
    let tmp = tempfile::tempdir().unwrap();
    common::write_dataset(tmp.path(), 8, 24);
    let dataset = Arc::new(CellDataset::open(tmp.path(), true).unwrap());
    let flows = ModelKind::SimpleUnet.input_flow(&NetworkConfig {
        patch_size: Some(16),
        ..NetworkConfig::default()
    });
    let mut loader = PrefetchLoader::new(dataset, flows.train, 1, 2, 1, 1);
    assert!(loader.next().is_some());
    drop(loader);
}

#[test]
fn single_training_step_produces_a_finite_loss() {
    let tmp = tempfile::tempdir().unwrap();
    common::write_dataset(tmp.path(), 2, 24);
    let config = tiny_config(&tmp.path().to_string_lossy(), "unused");
    let dataset = Arc::new(CellDataset::open(tmp.path(), true).unwrap());
    let flows = config.network.model.input_flow(&config.network);
    let batch = PrefetchLoader::new(dataset, flows.train, 2, 1, 1, 0)
        .next()
        .unwrap();

    let mut trainer = Trainer::<TestBackend>::new(config, Default::default()).unwrap();
    let first = trainer.train_step(&batch);
    let second = trainer.train_step(&batch);
    assert!(first.is_finite() && first > 0.0);
    assert!(second.is_finite());
}

#[test]
fn short_run_keeps_a_checkpoint_and_validates() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    common::write_dataset(data.path(), 6, 24);
    let config = tiny_config(&data.path().to_string_lossy(), &runs.path().to_string_lossy());

    let dataset = CellDataset::open(&config.train_dir, true).unwrap();
    let (train, valid) = dataset.split(config.valid_fraction, config.seed).unwrap();
    assert_eq!(valid.len(), 2);

    let mut trainer = Trainer::<TestBackend>::new(config, Default::default()).unwrap();
    trainer.set_valid_image_dir(runs.path().join("valid"));
    let mut store = BestCheckpointSaver::new(runs.path().join("model"), 3).unwrap();
    let outcome = trainer.train(train, valid, &mut store).unwrap();

    assert_eq!(outcome.epochs, 2);
    let saved = std::fs::read_dir(runs.path().join("valid")).unwrap().count();
    assert_eq!(saved, outcome.final_report.evaluated());
    // the metric runs once, on the second epoch
    let best = CheckpointStore::<TestBackend>::best(&store).unwrap();
    assert_eq!(best.step, 2);
    assert!(runs.path().join("model").join("checkpoint.json").exists());
    assert_eq!(outcome.final_report.evaluated() + outcome.final_report.skipped, 2);
}

#[test]
fn stop_requested_before_training_runs_no_epoch() {
    let data = tempfile::tempdir().unwrap();
    let runs = tempfile::tempdir().unwrap();
    common::write_dataset(data.path(), 4, 24);
    let mut config = tiny_config(&data.path().to_string_lossy(), &runs.path().to_string_lossy());
    config.epochs = 3;

    let dataset = CellDataset::open(&config.train_dir, true).unwrap();
    let (train, valid) = dataset.split(config.valid_fraction, config.seed).unwrap();
    let mut trainer = Trainer::<TestBackend>::new(config, Default::default()).unwrap();
    let mut store = BestCheckpointSaver::new(runs.path().join("model"), 3).unwrap();

    trainer.state().request_stop();
    let outcome = trainer.train(train, valid, &mut store).unwrap();
    assert_eq!(outcome.epochs, 0);
    assert!(!trainer.state().is_running());
    // the final validation still runs on the untouched network
    assert_eq!(outcome.final_report.evaluated() + outcome.final_report.skipped, 2);
}
