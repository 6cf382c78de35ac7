use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::dataset::CellDataset;
use crate::data::transforms::Pipeline;
use crate::error::Result;
use crate::inference::{InferenceEngine, InstanceDecoder, PatchPredictor};
use crate::types::{Image, InstanceMask};

const PALETTE: [[u8; 3]; 6] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
];

/// Run-length encoding in column-major order with 1-indexed starts:
/// `"start length start length ..."`.
pub fn rle_encode(mask: &InstanceMask) -> String {
    let (width, height) = (mask.width(), mask.height());
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut position = 0u64;
    for x in 0..width {
        for y in 0..height {
            position += 1;
            if !mask.contains(x, y) {
                continue;
            }
            match runs.last_mut() {
                Some((start, len)) if *start + *len == position => *len += 1,
                _ => runs.push((position, 1)),
            }
        }
    }

    let mut out = String::new();
    for (i, (start, len)) in runs.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{} {}", start, len);
    }
    out
}

/// Collects per-image results into an `ImageId,EncodedPixels` CSV.
pub struct Submission {
    dir: PathBuf,
    rows: Vec<(String, String)>,
}

impl Submission {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("images"))?;
        Ok(Self {
            dir,
            rows: Vec::new(),
        })
    }

    /// One row per instance; an image without instances gets an empty row.
    pub fn add_result(&mut self, id: &str, instances: &[InstanceMask]) {
        let before = self.rows.len();
        for instance in instances.iter().filter(|m| !m.is_empty()) {
            self.rows.push((id.to_string(), rle_encode(instance)));
        }
        if self.rows.len() == before {
            self.rows.push((id.to_string(), String::new()));
        }
    }

    pub fn save_image(&self, id: &str, image: &DynamicImage) -> Result<PathBuf> {
        let path = self.dir.join("images").join(format!("{}.png", id));
        image.save(&path)?;
        Ok(path)
    }

    /// Writes `submission.csv` and returns its path.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.dir.join("submission.csv");
        let mut csv = String::from("ImageId,EncodedPixels\n");
        for (id, pixels) in &self.rows {
            csv.push_str(id);
            csv.push(',');
            csv.push_str(pixels);
            csv.push('\n');
        }
        std::fs::write(&path, csv)?;
        log::info!("submission with {} rows written to {}", self.rows.len(), path.display());
        Ok(path)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// `image` with every instance tinted in its own color.
pub fn overlay(image: &Image, instances: &[InstanceMask]) -> RgbImage {
    let mut out = image.to_rgb8();
    for (i, instance) in instances.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        for (x, y, p) in instance.as_gray().enumerate_pixels() {
            if p[0] == 0 || x >= out.width() || y >= out.height() {
                continue;
            }
            let px = *out.get_pixel(x, y);
            let blended = Rgb([0, 1, 2].map(|c| ((px[c] as u16 + color[c] as u16) / 2) as u8));
            out.put_pixel(x, y, blended);
        }
    }
    out
}

/// Predicts every image of an unlabeled split and writes the submission.
///
/// Instances are mapped back to each image's original size before encoding.
pub fn write_submission<P: PatchPredictor + ?Sized>(
    predictor: &P,
    dataset: &CellDataset,
    pipeline: &Pipeline,
    engine: &InferenceEngine,
    decoder: &InstanceDecoder,
    dir: &Path,
) -> Result<PathBuf> {
    let mut submission = Submission::new(dir)?;
    let mut rng = StdRng::seed_from_u64(0);
    for idx in 0..dataset.len() {
        let sample = dataset.get(idx)?;
        let (height, width) = sample.size();
        let id = sample.id.clone();
        let prepared = pipeline.augment(sample, &mut rng)?;
        let merged = engine.infer(predictor, &prepared.image)?;
        let instances: Vec<InstanceMask> = decoder
            .decode(&merged)
            .iter()
            .map(|m| m.resize(width as u32, height as u32))
            .filter(|m| !m.is_empty())
            .collect();
        log::info!("{}: {} instances", id, instances.len());

        let original = if prepared.size() == (height, width) {
            prepared.image
        } else {
            prepared.image.resize(height, width)?
        };
        submission.save_image(&id, &DynamicImage::ImageRgb8(overlay(&original, &instances)))?;
        submission.add_result(&id, &instances);
    }
    submission.save()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_columns_top_to_bottom() {
        // 3x3, pixels (x, y): (0,1) (0,2) (1,0) (2,2)
        let mask = InstanceMask::from_pixels(3, 3, [(0, 1), (0, 2), (1, 0), (2, 2)]);
        assert_eq!(rle_encode(&mask), "2 3 9 1");
    }

    #[test]
    fn writes_csv_with_empty_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let mut submission = Submission::new(tmp.path()).unwrap();
        submission.add_result("a", &[InstanceMask::from_pixels(2, 2, [(0, 0)])]);
        submission.add_result("b", &[]);
        let path = submission.save().unwrap();
        let csv = std::fs::read_to_string(path).unwrap();
        assert_eq!(csv, "ImageId,EncodedPixels\na,1 1\nb,\n");
    }

    #[test]
    fn overlay_tints_only_instance_pixels() {
        let image = Image::zeros(2, 2, 1).unwrap();
        let rendered = overlay(&image, &[InstanceMask::from_pixels(2, 2, [(1, 1)])]);
        assert_eq!(rendered.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(rendered.get_pixel(1, 1), &Rgb([115, 12, 37]));
    }
}
