use crate::{
    apply_trainable_plan, LayerSelection, LayerSelectionError, ModelConfig, ModelInit,
    ModelLoadError, PretrainedSource, Seq2SeqBatch, Seq2SeqCollator, Seq2SeqLM, T5Config,
    T5ForConditionalGeneration, TrainOutput, Trainer, TrainerError, TrainablePlan,
};
use apteryx_core::{ConfigurationError, Overrides, Shuffle, TrainingArguments};
use apteryx_data_provider::{random_split, Collator, Dataset, SplitError, Subset};
use std::sync::Arc;
use tch::Device;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::info;

/// The four things a model family must provide to be wrapped as an autoencoder.
pub trait AutoencoderFamily {
    type Config: ModelConfig;
    type Model: Seq2SeqLM + 'static;
    type Collator: Collator<String, Batch = Seq2SeqBatch> + 'static;

    fn config(
        &self,
        source: &PretrainedSource<Self::Config>,
        overrides: &Overrides,
    ) -> Result<Self::Config, ModelLoadError>;

    fn model(
        &self,
        config: &Self::Config,
        source: &PretrainedSource<Self::Config>,
        init: ModelInit,
        device: Device,
    ) -> Result<Self::Model, ModelLoadError>;

    fn tokenizer(
        &self,
        source: &PretrainedSource<Self::Config>,
    ) -> Result<Tokenizer, ModelLoadError>;

    fn collator(
        &self,
        tokenizer: Tokenizer,
        config: &Self::Config,
        block_size: usize,
    ) -> Result<Self::Collator, ModelLoadError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct T5Family;

impl AutoencoderFamily for T5Family {
    type Config = T5Config;
    type Model = T5ForConditionalGeneration;
    type Collator = Seq2SeqCollator;

    fn config(
        &self,
        source: &PretrainedSource<T5Config>,
        overrides: &Overrides,
    ) -> Result<T5Config, ModelLoadError> {
        source.get_config_with_overrides(overrides)
    }

    fn model(
        &self,
        config: &T5Config,
        source: &PretrainedSource<T5Config>,
        init: ModelInit,
        device: Device,
    ) -> Result<T5ForConditionalGeneration, ModelLoadError> {
        T5ForConditionalGeneration::from_source(config, source, init, device)
    }

    fn tokenizer(&self, source: &PretrainedSource<T5Config>) -> Result<Tokenizer, ModelLoadError> {
        source.tokenizer()
    }

    fn collator(
        &self,
        tokenizer: Tokenizer,
        config: &T5Config,
        block_size: usize,
    ) -> Result<Seq2SeqCollator, ModelLoadError> {
        if block_size == 0 {
            return Err(ModelLoadError::UnsupportedConfig(
                "block_size must be at least 1".to_owned(),
            ));
        }
        Ok(Seq2SeqCollator::new(
            tokenizer,
            block_size,
            config.pad_token_id,
            config.eos_token_id,
            config.decoder_start_token_id,
        ))
    }
}

#[derive(Debug, Error)]
pub enum AutoencoderError {
    #[error("failed to load model: {0}")]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    LayerSelection(#[from] LayerSelectionError),

    #[error("invalid training arguments: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("training failed: {0}")]
    Trainer(#[from] TrainerError),
}

#[derive(Debug, Clone)]
pub struct AutoencoderArgs {
    /// Hub repo name or local directory.
    pub model_name: String,
    /// Model config keys replaced on top of the source's `config.json`.
    pub model_config: Overrides,
    /// Trainer keys replaced on top of [`TrainingArguments::defaults_for`].
    pub training_args: Overrides,
    /// Maximum tokens per example.
    pub block_size: usize,
    /// Fraction of the dataset used for training; the rest is held out for evaluation.
    pub train_pct: f64,
    pub layers: LayerSelection,
    pub init: ModelInit,
    pub device: Device,
    pub split: Shuffle,
}

impl AutoencoderArgs {
    pub fn new(model_name: impl Into<String>, block_size: usize) -> Self {
        Self {
            model_name: model_name.into(),
            model_config: Overrides::new(),
            training_args: Overrides::new(),
            block_size,
            train_pct: 0.8,
            layers: LayerSelection::default(),
            init: ModelInit::default(),
            device: Device::cuda_if_available(),
            split: Shuffle::default(),
        }
    }
}

/// A seq2seq model set up to reconstruct its input, with a chosen set of trainable blocks.
pub struct TransformerAutoencoder<F: AutoencoderFamily, D: Dataset<Item = String> + 'static> {
    args: AutoencoderArgs,
    config: F::Config,
    model: F::Model,
    collator: Arc<F::Collator>,
    dataset: Arc<D>,
    plan: TrainablePlan,
}

impl<F: AutoencoderFamily, D: Dataset<Item = String> + 'static> TransformerAutoencoder<F, D> {
    /// Resolves `args.model_name` to a local directory or hub repo. Weights are fetched only
    /// once the layer selection has been validated.
    pub fn new(family: F, dataset: D, args: AutoencoderArgs) -> Result<Self, AutoencoderError> {
        let source = PretrainedSource::<F::Config>::from_model_name(&args.model_name)?;
        Self::from_source(family, &source, dataset, args)
    }

    /// Loads everything from an already-resolved `source`. The layer selection is validated
    /// against the config before any weights are built.
    pub fn from_source(
        family: F,
        source: &PretrainedSource<F::Config>,
        dataset: D,
        args: AutoencoderArgs,
    ) -> Result<Self, AutoencoderError> {
        let tokenizer = family.tokenizer(source)?;
        let config = family.config(source, &args.model_config)?;
        let collator = family.collator(tokenizer, &config, args.block_size)?;

        let plan = args
            .layers
            .plan(config.num_encoder_layers(), config.num_decoder_layers())?;

        let mut model = family.model(&config, source, args.init, args.device)?;
        apply_trainable_plan(&mut model, &plan).map_err(ModelLoadError::from)?;
        info!(
            encoder = plan.encoder,
            decoder = plan.decoder,
            "autoencoder initialized; training lm_head and {} attention layers",
            plan.total()
        );

        Ok(Self {
            args,
            config,
            model,
            collator: Arc::new(collator),
            dataset: Arc::new(dataset),
            plan,
        })
    }

    pub fn config(&self) -> &F::Config {
        &self.config
    }

    pub fn model(&self) -> &F::Model {
        &self.model
    }

    pub fn collator(&self) -> &F::Collator {
        &self.collator
    }

    pub fn plan(&self) -> &TrainablePlan {
        &self.plan
    }

    /// Merges the training overrides, splits the dataset and hands both to a [`Trainer`].
    pub fn get_trainer(
        &mut self,
    ) -> Result<Trainer<'_, Subset<D>, F::Collator>, AutoencoderError> {
        let defaults = TrainingArguments::defaults_for(
            &self.args.model_name,
            chrono::Local::now().date_naive(),
        );
        let training_args = defaults.with_overrides(&self.args.training_args)?;
        let (train, eval) =
            random_split(self.dataset.clone(), self.args.train_pct, self.args.split)?;
        Ok(Trainer::new(
            &mut self.model,
            training_args,
            self.collator.clone(),
            train,
            Some(eval),
        )?)
    }

    pub fn train(&mut self) -> Result<TrainOutput, AutoencoderError> {
        Ok(self.get_trainer()?.run()?)
    }
}
