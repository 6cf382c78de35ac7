use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::types::{Image, InstanceMask};

#[derive(Debug, Clone)]
struct SampleEntry {
    id: String,
    image_path: PathBuf,
    mask_paths: Vec<PathBuf>,
}

/// One decoded image with its ground truth instances.
#[derive(Debug, Clone)]
pub struct CellSample {
    pub id: String,
    pub image: Image,
    /// Empty for unlabeled (test) samples.
    pub masks: Vec<InstanceMask>,
}

impl CellSample {
    /// Current `(height, width)` of `image`; augmentation may have changed it.
    pub fn size(&self) -> (usize, usize) {
        (self.image.height(), self.image.width())
    }
}

/// Cell images laid out one directory per sample:
///
/// ```text
/// root/
/// └── <id>/
///     ├── images/<id>.png
///     └── masks/*.png      (one binary mask per instance)
/// ```
///
/// Images are decoded lazily in [`CellDataset::get`].
#[derive(Debug, Clone)]
pub struct CellDataset {
    entries: Vec<SampleEntry>,
    color: bool,
}

impl CellDataset {
    /// Opens a labeled split. Samples without any mask are skipped.
    pub fn open<P: AsRef<Path>>(root: P, color: bool) -> Result<Self> {
        Self::scan(root.as_ref(), color, true)
    }

    /// Opens an unlabeled split; `masks/` is not read.
    pub fn open_test<P: AsRef<Path>>(root: P, color: bool) -> Result<Self> {
        Self::scan(root.as_ref(), color, false)
    }

    fn scan(root: &Path, color: bool, labeled: bool) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset directory not found: {}",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        for dir in WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let id = dir.file_name().to_string_lossy().to_string();
            let image_path = dir.path().join("images").join(format!("{}.png", id));
            if !image_path.is_file() {
                log::warn!("no image for sample {}, skipping", id);
                continue;
            }

            let mask_paths = if labeled {
                let paths = list_pngs(&dir.path().join("masks"));
                if paths.is_empty() {
                    log::warn!("no masks for sample {}, skipping", id);
                    continue;
                }
                paths
            } else {
                Vec::new()
            };

            entries.push(SampleEntry {
                id,
                image_path,
                mask_paths,
            });
        }

        if entries.is_empty() {
            return Err(Error::Dataset(format!(
                "no samples found in {}",
                root.display()
            )));
        }
        log::info!("loaded {} samples from {}", entries.len(), root.display());

        Ok(Self { entries, color })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.id.as_str())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Deterministic `(train, valid)` partition.
    pub fn split(&self, valid_fraction: f64, seed: u64) -> Result<(CellDataset, CellDataset)> {
        if !(0.0..1.0).contains(&valid_fraction) {
            return Err(Error::InvalidConfig(format!(
                "valid_fraction {} outside [0, 1)",
                valid_fraction
            )));
        }
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));

        let n_valid = ((self.entries.len() as f64 * valid_fraction).round() as usize)
            .min(self.entries.len().saturating_sub(1));
        let pick = |indices: &[usize]| {
            let mut indices = indices.to_vec();
            indices.sort_unstable();
            CellDataset {
                entries: indices.iter().map(|&i| self.entries[i].clone()).collect(),
                color: self.color,
            }
        };
        let valid = pick(&order[..n_valid]);
        let train = pick(&order[n_valid..]);
        log::info!("split: {} train / {} valid", train.len(), valid.len());
        Ok((train, valid))
    }

    pub fn get(&self, idx: usize) -> Result<CellSample> {
        let entry = self.entries.get(idx).ok_or_else(|| {
            Error::Dataset(format!(
                "index {} out of bounds, dataset has {} samples",
                idx,
                self.entries.len()
            ))
        })?;

        let decoded = image::open(&entry.image_path)?;
        let image = Image::from_dynamic(&decoded, self.color)?;

        let mut masks = Vec::with_capacity(entry.mask_paths.len());
        for path in &entry.mask_paths {
            let gray = image::open(path)?.to_luma8();
            if gray.dimensions() != decoded_dims(&image) {
                return Err(Error::Dataset(format!(
                    "mask {} is {}x{}, image is {}x{}",
                    path.display(),
                    gray.width(),
                    gray.height(),
                    image.width(),
                    image.height()
                )));
            }
            let mask = InstanceMask::from_gray(gray);
            if !mask.is_empty() {
                masks.push(mask);
            }
        }

        Ok(CellSample {
            id: entry.id.clone(),
            image,
            masks,
        })
    }
}

fn decoded_dims(image: &Image) -> (u32, u32) {
    (image.width() as u32, image.height() as u32)
}

fn list_pngs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")))
        .collect()
}
