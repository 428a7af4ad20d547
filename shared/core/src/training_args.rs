use crate::{merge_overrides, ConfigurationError, LearningRateSchedule, Overrides, SchedulerType};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStrategy {
    No,
    Steps,
    Epoch,
}

/// Immutable trainer configuration. Build it with [`TrainingArguments::defaults_for`] and
/// [`TrainingArguments::with_overrides`]; fields are never patched in place.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub overwrite_output_dir: bool,
    pub num_train_epochs: u32,
    pub max_steps: Option<u32>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub lr_scheduler_type: SchedulerType,
    pub warmup_steps: u32,
    pub logging_steps: u32,
    pub evaluation_strategy: EvaluationStrategy,
    pub eval_steps: Option<u32>,
    pub save_steps: u32,
    pub save_total_limit: Option<usize>,
    pub dataloader_num_workers: usize,
    pub fp16: bool,
    pub seed: u64,
}

impl TrainingArguments {
    /// The fixed defaults. `output_dir` is `{last segment of model_name}-{day}-{month}-{year}`.
    pub fn defaults_for(model_name: &str, date: impl Datelike) -> Self {
        let short_name = model_name.rsplit('/').next().unwrap_or(model_name);
        Self {
            output_dir: PathBuf::from(format!(
                "{short_name}-{}-{}-{}",
                date.day(),
                date.month(),
                date.year()
            )),
            overwrite_output_dir: true,
            num_train_epochs: 1,
            max_steps: None,
            per_device_train_batch_size: 32,
            per_device_eval_batch_size: 8,
            gradient_accumulation_steps: 5,
            learning_rate: 5e-5,
            weight_decay: 0.01,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            lr_scheduler_type: SchedulerType::Linear,
            warmup_steps: 50,
            logging_steps: 20,
            evaluation_strategy: EvaluationStrategy::Steps,
            eval_steps: Some(100),
            save_steps: 100,
            save_total_limit: Some(2),
            dataloader_num_workers: 15,
            fp16: true,
            seed: 42,
        }
    }

    pub fn with_overrides(&self, overrides: &Overrides) -> Result<Self, ConfigurationError> {
        let merged: Self = merge_overrides(self, overrides)?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let conflict = |msg: &str| Err(ConfigurationError::Conflict(msg.to_owned()));
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return conflict("batch sizes must be at least 1");
        }
        if self.gradient_accumulation_steps == 0 {
            return conflict("gradient_accumulation_steps must be at least 1");
        }
        if !(self.learning_rate > 0.0) {
            return conflict("learning_rate must be positive");
        }
        if self.weight_decay < 0.0 {
            return conflict("weight_decay must not be negative");
        }
        if self.logging_steps == 0 {
            return conflict("logging_steps must be at least 1");
        }
        if self.save_steps == 0 {
            return conflict("save_steps must be at least 1");
        }
        if self.save_total_limit == Some(0) {
            return conflict("save_total_limit of 0 would delete every checkpoint");
        }
        if self.evaluation_strategy == EvaluationStrategy::Steps && self.eval_steps == Some(0) {
            return conflict("evaluation_strategy \"steps\" needs eval_steps of at least 1");
        }
        if self.max_steps == Some(0) {
            return conflict("max_steps must be at least 1 when set");
        }
        Ok(())
    }

    /// Steps between evaluations; falls back to `logging_steps` when unset.
    pub fn eval_interval(&self) -> Option<u32> {
        match self.evaluation_strategy {
            EvaluationStrategy::Steps => Some(self.eval_steps.unwrap_or(self.logging_steps)),
            _ => None,
        }
    }

    pub fn lr_schedule(&self, total_steps: u32) -> LearningRateSchedule {
        LearningRateSchedule::new(
            self.lr_scheduler_type,
            self.learning_rate,
            self.warmup_steps,
            total_steps,
        )
    }
}
