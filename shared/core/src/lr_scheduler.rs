use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// How the learning rate moves after warmup.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    /// Straight line from the peak to zero at the last step.
    Linear,
    /// Half a cosine period from the peak to zero.
    Cosine,
    /// Stays at the peak.
    Constant,
}

/// A linear warmup from zero to `peak_lr` followed by a [`SchedulerType`] decay that reaches
/// zero at `total_steps`.
#[derive(Serialize, Deserialize, Clone, Debug, Copy, PartialEq)]
pub struct LearningRateSchedule {
    kind: SchedulerType,
    peak_lr: f64,
    warmup_steps: u32,
    total_steps: u32,
}

impl LearningRateSchedule {
    /// `warmup_steps` is capped at `total_steps`.
    pub fn new(kind: SchedulerType, peak_lr: f64, warmup_steps: u32, total_steps: u32) -> Self {
        Self {
            kind,
            peak_lr,
            warmup_steps: warmup_steps.min(total_steps),
            total_steps,
        }
    }

    pub fn kind(&self) -> SchedulerType {
        self.kind
    }

    pub fn warmup_steps(&self) -> u32 {
        self.warmup_steps
    }

    /// Fraction of the decay phase completed at `step`, in `[0, 1]`.
    fn decay_progress(&self, step: u32) -> f64 {
        let decay_steps = self.total_steps - self.warmup_steps;
        if decay_steps == 0 {
            return 1.0;
        }
        (step.min(self.total_steps) - self.warmup_steps) as f64 / decay_steps as f64
    }

    /// Learning rate for the optimizer step about to be taken (0-based).
    pub fn get_lr(&self, step: u32) -> f64 {
        // f64 throughout; cosine in particular drifts in f32
        if step < self.warmup_steps {
            return self.peak_lr * step as f64 / self.warmup_steps as f64;
        }
        let factor = match self.kind {
            SchedulerType::Constant => 1.0,
            SchedulerType::Linear => 1.0 - self.decay_progress(step),
            SchedulerType::Cosine => 0.5 * (1.0 + (PI * self.decay_progress(step)).cos()),
        };
        self.peak_lr * factor
    }
}
