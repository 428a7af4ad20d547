use anyhow::{anyhow, Result};
use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Cache, Repo, RepoType,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which files of a model repo to fetch. Everything else in a repo is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFiles {
    /// Configs, tokenizers and sentencepiece models.
    Metadata,
    /// `*.safetensors` weights.
    Weights,
}

impl ModelFiles {
    fn extensions(&self) -> &'static [&'static str] {
        match self {
            ModelFiles::Metadata => &[".json", ".model"],
            ModelFiles::Weights => &[".safetensors"],
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.extensions().iter().any(|ext| file_name.ends_with(ext))
    }
}

/// Downloads (or finds in the local hub cache) the `files` of `repo_id`.
pub fn download_model_repo_sync(
    repo_id: &str,
    revision: Option<String>,
    cache: Option<PathBuf>,
    token: Option<String>,
    progress_bar: bool,
    files: ModelFiles,
) -> Result<Vec<PathBuf>> {
    let repo = match revision {
        Some(revision) => Repo::with_revision(repo_id.to_owned(), RepoType::Model, revision),
        None => Repo::model(repo_id.to_owned()),
    };
    let cache = cache.map(Cache::new).unwrap_or_default();
    let api = ApiBuilder::new()
        .with_cache_dir(cache.path().clone())
        .with_token(token.or(cache.token()))
        .with_progress(progress_bar)
        .build()?
        .repo(repo);
    let fetched = api
        .info()?
        .siblings
        .into_iter()
        .filter(|x| files.matches(&x.rfilename))
        .map(|x| api.get(&x.rfilename))
        .collect::<Result<Vec<_>, ApiError>>()?;
    info!(repo_id, kind = ?files, files = fetched.len(), "Fetched model repo");
    Ok(fetched)
}

/// The `files` of a model: taken from `model` if it is a local directory, otherwise from the
/// hub repo of that name.
pub fn model_repo_files(model: &str, files: ModelFiles) -> Result<Vec<PathBuf>> {
    let path = Path::new(model);
    if path.is_dir() {
        info!(model, kind = ?files, "Using local model directory");
        let mut listed = Vec::new();
        for entry in std::fs::read_dir(path)
            .map_err(|e| anyhow!("couldn't read model directory {model}: {e}"))?
        {
            let entry = entry?.path();
            if entry
                .file_name()
                .and_then(|x| x.to_str())
                .is_some_and(|x| files.matches(x))
            {
                listed.push(entry);
            }
        }
        return Ok(listed);
    }
    info!(model, kind = ?files, "Downloading model repo");
    download_model_repo_sync(model, None, None, None, false, files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_directory_is_listed_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["config.json", "tokenizer.json", "model.safetensors", "README.md"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        let model = dir.path().to_str().unwrap();

        let mut metadata = model_repo_files(model, ModelFiles::Metadata).unwrap();
        metadata.sort();
        assert_eq!(
            metadata,
            vec![dir.path().join("config.json"), dir.path().join("tokenizer.json")]
        );
        assert_eq!(
            model_repo_files(model, ModelFiles::Weights).unwrap(),
            vec![dir.path().join("model.safetensors")]
        );
    }

    #[test]
    fn weights_and_metadata_are_disjoint() {
        assert!(ModelFiles::Weights.matches("model.safetensors"));
        assert!(!ModelFiles::Metadata.matches("model.safetensors"));
        assert!(ModelFiles::Metadata.matches("tokenizer.json"));
        assert!(ModelFiles::Metadata.matches("spiece.model"));
        assert!(!ModelFiles::Weights.matches("pytorch_model.bin"));
        assert!(!ModelFiles::Metadata.matches("README.md"));
    }
}
