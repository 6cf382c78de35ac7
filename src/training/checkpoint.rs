use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::UNet;

const INDEX_FILE: &str = "checkpoint.json";
const RECORD_EXTENSION: &str = "bin";

/// Writes the network parameters to `path` (the recorder appends `.bin`).
pub fn save_model<B: Backend>(model: &UNet<B>, path: &Path) -> Result<()> {
    BinFileRecorder::<FullPrecisionSettings>::new()
        .record(model.clone().into_record(), path.to_path_buf())
        .map_err(|e| Error::Record(format!("failed to save {}: {:?}", path.display(), e)))
}

/// Loads parameters saved by [`save_model`] into an already built network.
pub fn load_model<B: Backend>(model: UNet<B>, path: &Path, device: &B::Device) -> Result<UNet<B>> {
    let record = BinFileRecorder::<FullPrecisionSettings>::new()
        .load(path.to_path_buf(), device)
        .map_err(|e| Error::Record(format!("failed to load {}: {:?}", path.display(), e)))?;
    Ok(model.load_record(record))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub step: usize,
    pub score: f64,
    /// Record path without extension, as passed to the recorder.
    pub path: PathBuf,
}

/// Where scored snapshots of the network go.
pub trait CheckpointStore<B: Backend> {
    /// Offers a snapshot; returns whether it was kept.
    fn handle(&mut self, score: f64, model: &UNet<B>, step: usize) -> Result<bool>;

    /// Highest-scoring snapshot kept so far.
    fn best(&self) -> Option<&CheckpointEntry>;

    /// Loads the best snapshot into `model`.
    fn restore(&self, model: UNet<B>, device: &B::Device) -> Result<UNet<B>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointIndex {
    maximize: bool,
    entries: Vec<CheckpointEntry>,
}

/// Keeps the `num_to_keep` highest-scoring snapshots on disk.
///
/// `checkpoint.json` in the directory lists the kept entries best first and
/// is reloaded by [`BestCheckpointSaver::new`], so a restarted run continues
/// the same ranking.
pub struct BestCheckpointSaver {
    dir: PathBuf,
    num_to_keep: usize,
    entries: Vec<CheckpointEntry>,
}

impl BestCheckpointSaver {
    pub fn new<P: AsRef<Path>>(dir: P, num_to_keep: usize) -> Result<Self> {
        if num_to_keep == 0 {
            return Err(Error::InvalidConfig("num_to_keep must be positive".to_string()));
        }
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let entries = if index_path.is_file() {
            let index: CheckpointIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
            log::info!("resuming {} checkpoints from {}", index.entries.len(), index_path.display());
            index.entries
        } else {
            Vec::new()
        };

        Ok(Self {
            dir,
            num_to_keep,
            entries,
        })
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.entries
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_index(&self) -> Result<()> {
        let index = CheckpointIndex {
            maximize: true,
            entries: self.entries.clone(),
        };
        std::fs::write(self.dir.join(INDEX_FILE), serde_json::to_string_pretty(&index)?)?;
        Ok(())
    }

    /// `model-<step>`, suffixed when a kept entry already owns that name.
    fn record_path(&self, step: usize) -> PathBuf {
        let taken = |path: &Path| self.entries.iter().any(|e| e.path == path);
        let mut path = self.dir.join(format!("model-{}", step));
        let mut suffix = 1;
        while taken(&path) {
            path = self.dir.join(format!("model-{}-{}", step, suffix));
            suffix += 1;
        }
        path
    }

    fn qualifies(&self, score: f64) -> bool {
        self.entries.len() < self.num_to_keep
            || self.entries.last().is_some_and(|worst| score > worst.score)
    }
}

impl<B: Backend> CheckpointStore<B> for BestCheckpointSaver {
    fn handle(&mut self, score: f64, model: &UNet<B>, step: usize) -> Result<bool> {
        if score.is_nan() {
            log::warn!("step {}: NaN score, checkpoint not considered", step);
            return Ok(false);
        }
        if !self.qualifies(score) {
            log::debug!("step {}: score {:.4} below the kept checkpoints", step, score);
            return Ok(false);
        }

        let path = self.record_path(step);
        save_model(model, &path)?;

        // ties keep the earlier snapshot ahead
        let at = self.entries.partition_point(|e| e.score >= score);
        self.entries.insert(
            at,
            CheckpointEntry {
                step,
                score,
                path,
            },
        );
        while self.entries.len() > self.num_to_keep {
            if let Some(evicted) = self.entries.pop() {
                let file = evicted.path.with_extension(RECORD_EXTENSION);
                if let Err(e) = std::fs::remove_file(&file) {
                    log::warn!("could not remove {}: {}", file.display(), e);
                }
            }
        }
        self.write_index()?;

        log::info!(
            "checkpoint saved: step {} score {:.4} (best {:.4})",
            step,
            score,
            self.entries[0].score
        );
        Ok(true)
    }

    fn best(&self) -> Option<&CheckpointEntry> {
        self.entries.first()
    }

    fn restore(&self, model: UNet<B>, device: &B::Device) -> Result<UNet<B>> {
        let best = self
            .entries
            .first()
            .ok_or_else(|| Error::Record(format!("no checkpoint in {}", self.dir.display())))?;
        log::info!("restoring checkpoint step {} (score {:.4})", best.step, best.score);
        load_model(model, &best.path, device)
    }
}
