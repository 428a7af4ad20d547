use crate::{
    safetensor_loader::{load_safetensors_into_variables, load_tensors_into_variables},
    LoadSafetensorsError, ModelConfig,
};
use apteryx_core::{merge_overrides, ConfigurationError, Overrides};
use apteryx_data_provider::{model_repo_files, ModelFiles};
use std::{
    collections::{HashMap, HashSet},
    io,
    path::PathBuf,
    sync::Arc,
};
use tch::Tensor;
use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("missing config.json")]
    MissingConfigJSON,

    #[error("failed to read file config.json")]
    FailedToReadConfig(#[from] io::Error),

    #[error("could not parse config.json")]
    FailedToParseConfig(#[from] serde_json::Error),

    #[error("invalid model config override: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("unsupported model config: {0}")]
    UnsupportedConfig(String),

    #[error("could not fetch model files: {0}")]
    Fetch(#[from] anyhow::Error),

    #[error("could not find tokenizer.json")]
    MissingTokenizer,

    #[error("could not load tokenizer: {0}")]
    Tokenizer(String),

    #[error("Failed to load safetensors: {0}")]
    LoadSafetensorsError(#[from] LoadSafetensorsError),

    #[error("Failed to copy tensor into variable store: {0}")]
    CopyTensorError(#[from] tch::TchError),

    #[error("Some parameters were not loaded: {0:?}")]
    LoadTensorError(HashSet<String>),
}

/// How a model's weights are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelInit {
    /// Copy weights from the source's safetensors.
    #[default]
    Pretrained,
    /// Fresh weights drawn from the config's initialization scheme.
    FromConfig,
}

#[derive(Clone)]
pub enum PretrainedSource<T: ModelConfig> {
    /// An explicit list of files, weights included.
    RepoFiles(Vec<PathBuf>),
    /// A local directory or hub repo. Only its metadata is at hand; the weights are fetched
    /// when [`load`](PretrainedSource::load) is called.
    Named { model: String, files: Vec<PathBuf> },
    ConfigAndTensors(T, Arc<HashMap<String, Tensor>>),
}

unsafe impl<T: ModelConfig> Send for PretrainedSource<T> {}

impl<T: ModelConfig> std::fmt::Debug for PretrainedSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepoFiles(files) => f.debug_tuple("RepoFiles").field(files).finish(),
            Self::Named { model, files } => f
                .debug_struct("Named")
                .field("model", model)
                .field("files", files)
                .finish(),
            Self::ConfigAndTensors(config, tensors) => f
                .debug_struct("ConfigAndTensors")
                .field("config", config)
                .field("num_tensors", &tensors.len())
                .finish(),
        }
    }
}

impl<T: ModelConfig> PretrainedSource<T> {
    /// A local directory of model files, or otherwise a hub repo name. Fetches the config and
    /// tokenizer only.
    pub fn from_model_name(model: &str) -> Result<Self, ModelLoadError> {
        Ok(Self::Named {
            model: model.to_owned(),
            files: model_repo_files(model, ModelFiles::Metadata)?,
        })
    }

    fn repo_file(&self, file_name: &str) -> Option<&PathBuf> {
        match self {
            PretrainedSource::RepoFiles(files) | PretrainedSource::Named { files, .. } => {
                files.iter().find(|x| x.ends_with(file_name))
            }
            PretrainedSource::ConfigAndTensors(..) => None,
        }
    }

    pub fn get_config(&self) -> Result<T, ModelLoadError> {
        match self {
            PretrainedSource::RepoFiles(_) | PretrainedSource::Named { .. } => {
                let config_file = std::fs::read_to_string(
                    self.repo_file("config.json")
                        .ok_or(ModelLoadError::MissingConfigJSON)?,
                )?;
                Ok(serde_json::from_str(&config_file)?)
            }
            PretrainedSource::ConfigAndTensors(config, _) => Ok(config.clone()),
        }
    }

    /// The source's config with `overrides` merged on top.
    pub fn get_config_with_overrides(&self, overrides: &Overrides) -> Result<T, ModelLoadError> {
        Ok(merge_overrides(&self.get_config()?, overrides)?)
    }

    pub fn tokenizer(&self) -> Result<Tokenizer, ModelLoadError> {
        let path = self
            .repo_file("tokenizer.json")
            .ok_or(ModelLoadError::MissingTokenizer)?;
        Tokenizer::from_file(path).map_err(|e| ModelLoadError::Tokenizer(e.to_string()))
    }

    pub fn load(&self, variables: &mut tch::nn::VarStore) -> Result<(), ModelLoadError> {
        match self {
            PretrainedSource::RepoFiles(repo_files) => {
                load_safetensors_into_variables(variables, repo_files)?
            }
            PretrainedSource::Named { model, .. } => {
                let weights = model_repo_files(model, ModelFiles::Weights)?;
                load_safetensors_into_variables(variables, &weights)?
            }
            PretrainedSource::ConfigAndTensors(_, parameters) => {
                match load_tensors_into_variables(variables, parameters) {
                    Err(LoadSafetensorsError::MissingVariables(unmatched)) => {
                        return Err(ModelLoadError::LoadTensorError(unmatched))
                    }
                    result => result?,
                }
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::T5Config;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn config_is_read_from_repo_files_and_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            json!({"d_model": 64, "num_layers": 3, "architectures": ["T5ForConditionalGeneration"]})
                .to_string(),
        )
        .unwrap();
        let source = PretrainedSource::<T5Config>::RepoFiles(vec![config_path]);

        let config = source.get_config().unwrap();
        assert_eq!(config.d_model, 64);
        assert_eq!(config.num_layers, 3);

        let overrides = json!({"dropout_rate": 0.0, "num_decoder_layers": 1});
        let merged = source
            .get_config_with_overrides(overrides.as_object().unwrap())
            .unwrap();
        assert_eq!(merged.dropout_rate, 0.0);
        assert_eq!(merged.num_decoder_layers, Some(1));
        assert_eq!(merged.d_model, 64);
    }

    #[test]
    fn unknown_model_override_is_rejected() {
        let source =
            PretrainedSource::ConfigAndTensors(T5Config::default(), Arc::new(HashMap::new()));
        let overrides = json!({"n_embd": 12});
        assert!(matches!(
            source.get_config_with_overrides(overrides.as_object().unwrap()),
            Err(ModelLoadError::Configuration(ConfigurationError::UnknownKey(_)))
        ));
    }

    #[test]
    fn named_source_defers_weights_until_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&T5Config::default()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"not a safetensors file").unwrap();

        let source =
            PretrainedSource::<T5Config>::from_model_name(dir.path().to_str().unwrap()).unwrap();
        let PretrainedSource::Named { files, .. } = &source else {
            panic!("expected a named source, got {source:?}");
        };
        assert_eq!(files, &vec![dir.path().join("config.json")]);
        assert!(source.get_config().is_ok());

        let mut variables = tch::nn::VarStore::new(tch::Device::Cpu);
        let _ = variables.root().zeros("weight", &[2]);
        assert!(matches!(
            source.load(&mut variables),
            Err(ModelLoadError::LoadSafetensorsError(
                LoadSafetensorsError::Deserialize(_)
            ))
        ));
    }

    #[test]
    fn missing_files_are_reported() {
        let source = PretrainedSource::<T5Config>::RepoFiles(vec![]);
        assert!(matches!(
            source.get_config(),
            Err(ModelLoadError::MissingConfigJSON)
        ));
        assert!(matches!(
            source.tokenizer(),
            Err(ModelLoadError::MissingTokenizer)
        ));
    }
}
