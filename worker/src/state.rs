use machine_learning::{arch::params::ParamSnapshot, optimization::OptimizerState};

/// Everything a run needs to continue where it stopped.
///
/// This is the only content of a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub model: ParamSnapshot,
    pub optimizer: OptimizerState,
    /// The last completed epoch.
    pub epoch: usize,
    pub best_iou: f64,
    pub best_acc: f64,
}

impl TrainingState {
    pub fn best(&self) -> BestTracker {
        BestTracker {
            best_iou: self.best_iou,
            best_acc: self.best_acc,
        }
    }
}

/// The best changed-class IoU seen so far and the accuracy of that same epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BestTracker {
    pub best_iou: f64,
    pub best_acc: f64,
}

impl BestTracker {
    /// Records an epoch's results.
    ///
    /// # Returns
    /// Whether the epoch is at least as good as every previous one, ties count as best.
    pub fn observe(&mut self, changed_iou: f64, acc: f64) -> bool {
        let is_best = changed_iou >= self.best_iou;
        if is_best {
            self.best_iou = changed_iou;
            self.best_acc = acc;
        }

        is_best
    }
}
