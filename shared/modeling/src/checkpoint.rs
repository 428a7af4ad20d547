use crate::Seq2SeqLM;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const MODEL_FILE: &str = "model.safetensors";
pub const CONFIG_FILE: &str = "config.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub step: u32,
    pub epoch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
}

/// Progress written next to each checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainerState {
    pub global_step: u32,
    pub epoch: u32,
    pub log_history: Vec<LogEntry>,
}

pub fn checkpoint_dir(output_dir: &Path, step: u32) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

/// Writes the model weights and its config into `dir`.
pub fn save_model(model: &dyn Seq2SeqLM, dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dir)?;
    model.variables().save(dir.join(MODEL_FILE))?;
    fs::write(dir.join(CONFIG_FILE), model.config_json()?)?;
    Ok(())
}

/// Saves `checkpoint-{step}` under `output_dir`.
pub fn save_checkpoint(
    model: &dyn Seq2SeqLM,
    state: &TrainerState,
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let dir = checkpoint_dir(output_dir, state.global_step);
    save_model(model, &dir)?;
    fs::write(
        dir.join(TRAINER_STATE_FILE),
        serde_json::to_string_pretty(state)?,
    )?;
    info!(path = %dir.display(), step = state.global_step, "Saved checkpoint");
    Ok(dir)
}

/// `checkpoint-{step}` directories under `output_dir`, oldest step first.
pub fn list_checkpoints(output_dir: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let step = path
            .file_name()
            .and_then(|x| x.to_str())
            .and_then(|x| x.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|x| x.parse::<u32>().ok());
        if let Some(step) = step {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort();
    Ok(checkpoints)
}

/// Deletes the oldest checkpoints until at most `limit` remain. Returns what was deleted.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> io::Result<Vec<PathBuf>> {
    let checkpoints = list_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    let mut deleted = Vec::with_capacity(excess);
    for (step, path) in checkpoints.into_iter().take(excess) {
        debug!(step, path = %path.display(), "Deleting old checkpoint");
        fs::remove_dir_all(&path)?;
        deleted.push(path);
    }
    Ok(deleted)
}
