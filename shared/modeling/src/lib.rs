mod attention;
mod auto_config;
mod autoencoder;
pub mod checkpoint;
mod collator;
mod layer_selection;
mod optimizer;
mod rms_norm;
mod safetensor_loader;
mod t5;
mod trainer;
mod traits;

pub use attention::{relative_position_bucket, AttentionConfig, T5Attention};
pub use auto_config::{ModelInit, ModelLoadError, PretrainedSource};
pub use autoencoder::{
    AutoencoderArgs, AutoencoderError, AutoencoderFamily, T5Family, TransformerAutoencoder,
};
pub use collator::{collate_token_ids, Seq2SeqBatch, Seq2SeqCollator, IGNORE_INDEX};
pub use layer_selection::{
    apply_trainable_plan, toggle_layers, LayerSelection, LayerSelectionError, Section,
    TrainablePlan,
};
pub use optimizer::Optimizer;
pub use rms_norm::T5LayerNorm;
pub use safetensor_loader::{
    load_safetensors_into_variables, load_tensors_into_variables, LoadSafetensorsError,
};
pub use t5::{Activation, T5Config, T5ForConditionalGeneration};
pub use trainer::{TrainOutput, Trainer, TrainerError};
pub use traits::{LayerParameters, ModelConfig, Seq2SeqLM, Seq2SeqTensors};

#[cfg(test)]
pub fn set_torch_rng_seed() {
    use rand::Rng;

    let seed: i64 = rand::thread_rng().gen();
    tch::manual_seed(seed);
    println!("torch seed set to: {}", seed);
}
