use std::fmt::Debug;
use tch::{nn::VarStore, Device, TchError, Tensor};

/// Device-resident inputs for one seq2seq forward pass.
#[derive(Debug)]
pub struct Seq2SeqTensors {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub decoder_input_ids: Tensor,
    pub decoder_attention_mask: Tensor,
    pub labels: Option<Tensor>,
}

/// The parameters owned by one transformer block, gathered from the var store by name prefix.
#[derive(Debug)]
pub struct LayerParameters {
    pub name: String,
    pub parameters: Vec<Tensor>,
}

impl LayerParameters {
    pub fn from_prefix(variables: &VarStore, prefix: &str) -> Self {
        let dotted = format!("{prefix}.");
        let mut named = variables
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with(&dotted))
            .collect::<Vec<_>>();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: prefix.to_owned(),
            parameters: named.into_iter().map(|(_, tensor)| tensor).collect(),
        }
    }

    pub fn set_trainable(&self, trainable: bool) {
        for parameter in &self.parameters {
            let _ = parameter.set_requires_grad(trainable);
        }
    }

    pub fn is_trainable(&self) -> bool {
        !self.parameters.is_empty() && self.parameters.iter().all(|x| x.requires_grad())
    }
}

/// An encoder-decoder language model that can be trained.
///
/// Layer accessors return blocks in execution order, so "the last n layers" are the tail of
/// each vector.
pub trait Seq2SeqLM: Send + Debug {
    /// Returns `(logits, loss)`; the loss is present when `inputs.labels` is.
    fn forward(&self, inputs: &Seq2SeqTensors, train: bool) -> (Tensor, Option<Tensor>);
    fn encoder_layers(&self) -> Vec<LayerParameters>;
    fn decoder_layers(&self) -> Vec<LayerParameters>;
    /// The parameters of the task head. With tied embeddings this is the shared embedding.
    fn head_parameters(&self) -> Vec<Tensor>;
    /// Gives a head tied to the input embedding its own parameter, initialized so the logits
    /// are unchanged. A no-op for untied heads.
    fn untie_head(&mut self) -> Result<(), TchError> {
        Ok(())
    }
    fn variables(&self) -> &VarStore;
    fn device(&self) -> Device;
    fn config_json(&self) -> serde_json::Result<String>;

    /// Parameters that currently require grad, ordered by name.
    fn trainable_parameters(&self) -> Vec<Tensor> {
        let mut named = self
            .variables()
            .variables()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .collect::<Vec<_>>();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named.into_iter().map(|(_, tensor)| tensor).collect()
    }
}

pub trait ModelConfig: serde::Serialize + serde::de::DeserializeOwned + Clone + Debug {
    fn num_encoder_layers(&self) -> usize;
    fn num_decoder_layers(&self) -> usize;
}
