mod config;
mod data_shuffle;
mod lr_scheduler;
mod training_args;

pub use config::{merge_overrides, ConfigurationError, Overrides};
pub use data_shuffle::Shuffle;
pub use lr_scheduler::{LearningRateSchedule, SchedulerType};
pub use training_args::{EvaluationStrategy, TrainingArguments};
