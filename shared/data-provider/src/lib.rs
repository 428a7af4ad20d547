mod dataset;
mod hub;
mod loader;
mod local;
mod split;

pub use dataset::{Dataset, Subset};
pub use hub::{download_model_repo_sync, model_repo_files, ModelFiles};
pub use loader::{Collator, DataLoader};
pub use local::LocalTextDataset;
pub use split::{random_split, split_lengths, SplitError};
