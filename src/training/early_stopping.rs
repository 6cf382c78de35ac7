use std::fmt;

/// Epochs between the compared losses in the plateau check.
const PLATEAU_WINDOW: usize = 100;
const PLATEAU_TOLERANCE: f32 = 1.05;

/// Why a run was abandoned early.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Loss is above the one recorded 100 epochs ago (with 5% slack).
    Plateau { reference: f32, current: f32 },
    /// Training loss still too high at a checkpoint epoch.
    SlowStart { epoch: usize, loss: f32 },
    /// Best validation score too low at this point.
    LowScore { epoch: usize, best: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Plateau { reference, current } => write!(
                f,
                "not improved: loss {:.4} vs {:.4} {} epochs ago",
                current, reference, PLATEAU_WINDOW
            ),
            Rejection::SlowStart { epoch, loss } => {
                write!(f, "not improved training loss {:.4} at epoch {}", loss, epoch)
            }
            Rejection::LowScore { epoch, best } => {
                write!(f, "best validation score {:.4} too low at epoch {}", best, epoch)
            }
        }
    }
}

/// Abandons runs that are clearly not going anywhere.
///
/// Epochs are 0-based indices. When disabled the checks still record
/// history but never reject.
#[derive(Debug, Clone)]
pub struct EarlyRejection {
    enabled: bool,
    losses: Vec<f32>,
    best_score: f64,
}

impl EarlyRejection {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            losses: Vec::new(),
            best_score: 0.0,
        }
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn losses(&self) -> &[f32] {
        &self.losses
    }

    /// Records the epoch's training loss and checks the loss rules.
    pub fn check_loss(&mut self, epoch: usize, loss: f32) -> Option<Rejection> {
        self.losses.push(loss);
        if !self.enabled {
            return None;
        }

        let n = self.losses.len();
        if n > PLATEAU_WINDOW {
            let reference = self.losses[n - PLATEAU_WINDOW];
            if reference * PLATEAU_TOLERANCE < loss {
                return Some(Rejection::Plateau {
                    reference,
                    current: loss,
                });
            }
        }

        if (epoch == 50 && loss > 0.5) || (epoch == 200 && loss > 0.2) {
            return Some(Rejection::SlowStart { epoch, loss });
        }
        None
    }

    /// Records a validation score and checks the score rules.
    pub fn check_score(&mut self, epoch: usize, score: f64) -> Option<Rejection> {
        if score > self.best_score {
            self.best_score = score;
        }
        if !self.enabled {
            return None;
        }
        let best = self.best_score;
        if (epoch > 50 && best < 0.15) || (epoch > 100 && best < 0.25) {
            return Some(Rejection::LowScore { epoch, best });
        }
        None
    }
}
