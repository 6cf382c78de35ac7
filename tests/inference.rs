use burn::backend::NdArray;

use cell_segmentation::inference::{sliding_windows, InferenceEngine, InstanceDecoder};
use cell_segmentation::model::ModelKind;
use cell_segmentation::training::{score, InferenceConfig, NetworkConfig, ThresholdList};
use cell_segmentation::types::{Image, InstanceMask, ProbabilityMap};

type TestBackend = NdArray;

#[test]
fn windows_tile_a_300_image_with_two_per_axis() {
    // four windows in total: 0.5 overlap of 228 on 300 gives starts 0 and 72
    let windows = sliding_windows(300, 300, 228, 0.5).unwrap();
    assert_eq!(windows.len(), 4);
    let mut xs: Vec<usize> = windows.iter().map(|w| w.x).collect();
    xs.sort_unstable();
    xs.dedup();
    assert_eq!(xs, vec![0, 72]);
    let mut covered = vec![false; 300 * 300];
    for window in &windows {
        let (rows, cols) = window.indices();
        for y in rows {
            for x in cols.clone() {
                covered[y * 300 + x] = true;
            }
        }
    }
    assert!(covered.into_iter().all(|c| c));
}

#[test]
fn network_inference_returns_a_full_size_map() {
    let config = NetworkConfig {
        model: ModelKind::Unet,
        patch_size: Some(28),
        stage_count: 2,
        base_width: 4,
        ..NetworkConfig::default()
    };
    let device = Default::default();
    let network = config.model.build::<TestBackend>(&config, &device).unwrap();

    let image = Image::zeros(40, 50, 3).unwrap();
    let engine = InferenceEngine::from_config(&InferenceConfig::default()).unwrap();
    let merged = engine.infer(&network, &image).unwrap();
    assert_eq!(merged.dimensions(), (50, 40));
    assert!(merged.pixels().all(|p| (0.0..=1.0).contains(&p[0])));

    // small images are upscaled before inference
    let small = Image::zeros(10, 12, 3).unwrap();
    let prepared = config.model.preprocess(&config, &small).unwrap();
    assert_eq!(prepared.height(), 28);
    let instances = config
        .model
        .inference(&network, &engine, &InstanceDecoder::default(), &prepared)
        .unwrap();
    assert!(instances.iter().all(|m| m.width() as usize == prepared.width()));
}

#[test]
fn decoded_instances_score_against_ground_truth() {
    let mut map = ProbabilityMap::new(20, 20);
    let square = |x0: u32, y0: u32| {
        (y0..y0 + 5).flat_map(move |y| (x0..x0 + 5).map(move |x| (x, y)))
    };
    for (x, y) in square(2, 2).chain(square(12, 10)) {
        map.put_pixel(x, y, image::Luma([0.95]));
    }
    let decoder = InstanceDecoder::new(0.5, 0.9, true, 10);
    let predicted = decoder.decode(&map);
    assert_eq!(predicted.len(), 2);

    let ground_truth = vec![
        InstanceMask::from_pixels(20, 20, square(2, 2)),
        InstanceMask::from_pixels(20, 20, square(12, 10)),
    ];
    let counts = score(&ThresholdList::default(), &predicted, &ground_truth);
    assert_eq!(counts.image_score(), Some(1.0));
}
