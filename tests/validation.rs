mod common;

use image::GrayImage;

use cell_segmentation::data::{CellDataset, Pipeline};
use cell_segmentation::inference::{InferenceEngine, InstanceDecoder, PatchPredictor};
use cell_segmentation::training::{Evaluator, MetricPool, ThresholdList};
use cell_segmentation::Result;

/// Foreground wherever the first channel is bright.
struct BrightnessPredictor {
    patch: usize,
}

impl PatchPredictor for BrightnessPredictor {
    fn patch_size(&self) -> usize {
        self.patch
    }

    fn predict_patches(&self, patches: Vec<f32>, _count: usize, channels: usize) -> Result<Vec<f32>> {
        let tile = self.patch * self.patch;
        Ok(patches
            .chunks(channels * tile)
            .flat_map(|p| p[..tile].iter().map(|&v| if v > 0.5 { 1.0 } else { 0.0 }))
            .collect())
    }
}

#[test]
fn unreadable_image_is_skipped_and_the_rest_scored() {
    let data = tempfile::tempdir().unwrap();
    common::write_dataset(data.path(), 2, 24);
    common::write_sample(data.path(), "cell02", 24, &[(2, 2, 6)]);
    // mask no longer matches its 24x24 image
    GrayImage::new(20, 20)
        .save(data.path().join("cell02/masks/cell02_0.png"))
        .unwrap();

    let dataset = CellDataset::open(data.path(), true).unwrap();
    assert_eq!(dataset.len(), 3);

    let pool = MetricPool::new(2, ThresholdList::default()).unwrap();
    let out = tempfile::tempdir().unwrap();
    let evaluator = Evaluator {
        pool: &pool,
        engine: InferenceEngine::new(0.5, 4).unwrap(),
        decoder: InstanceDecoder::default(),
        pipeline: Pipeline::full_image(16),
        image_dir: Some(out.path().join("valid")),
    };
    let report = evaluator.evaluate(&BrightnessPredictor { patch: 16 }, &dataset);

    assert_eq!(report.skipped, 1);
    assert_eq!(report.evaluated(), 2);
    let ids: Vec<&str> = report.per_image.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["cell00", "cell01"]);
    assert!(report.per_image.iter().all(|r| r.score == Some(1.0)));
    assert_eq!(report.mean_iou(), Some(1.0));

    assert!(out.path().join("valid/cell00_1.000.png").is_file());
    assert!(out.path().join("valid/cell01_1.000.png").is_file());
    assert!(!out.path().join("valid").read_dir().unwrap().any(|e| {
        e.unwrap().file_name().to_string_lossy().starts_with("cell02")
    }));
}
