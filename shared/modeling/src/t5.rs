use crate::{
    attention::AttentionConfig, LayerParameters, ModelConfig, ModelInit, ModelLoadError,
    PretrainedSource, Seq2SeqLM, Seq2SeqTensors, T5Attention, T5LayerNorm,
};
use serde::{Deserialize, Serialize};
use tch::{
    nn::{self, Module, VarStore},
    Device, Kind, TchError, Tensor,
};
use tracing::debug;

/// The fields of a Hugging Face `T5Config` this model uses. Missing fields take the `t5-small`
/// values, and fields it doesn't know (`architectures`, `task_specific_params`, ...) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    pub relative_attention_num_buckets: usize,
    pub relative_attention_max_distance: usize,
    pub dropout_rate: f64,
    pub layer_norm_epsilon: f64,
    pub initializer_factor: f64,
    pub feed_forward_proj: String,
    pub tie_word_embeddings: bool,
    pub pad_token_id: i64,
    pub eos_token_id: i64,
    pub decoder_start_token_id: i64,
}

impl Default for T5Config {
    fn default() -> Self {
        Self {
            vocab_size: 32128,
            d_model: 512,
            d_kv: 64,
            d_ff: 2048,
            num_layers: 6,
            num_decoder_layers: None,
            num_heads: 8,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            dropout_rate: 0.1,
            layer_norm_epsilon: 1e-6,
            initializer_factor: 1.0,
            feed_forward_proj: "relu".to_owned(),
            tie_word_embeddings: true,
            pad_token_id: 0,
            eos_token_id: 1,
            decoder_start_token_id: 0,
        }
    }
}

impl ModelConfig for T5Config {
    fn num_encoder_layers(&self) -> usize {
        self.num_layers
    }

    fn num_decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Gelu,
    /// tanh approximation
    GeluNew,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Gelu => xs.gelu("none"),
            Activation::GeluNew => xs.gelu("tanh"),
        }
    }
}

impl T5Config {
    /// Parses `feed_forward_proj` into `(gated, activation)`.
    pub fn feed_forward(&self) -> Result<(bool, Activation), ModelLoadError> {
        let unsupported = || {
            ModelLoadError::UnsupportedConfig(format!(
                "feed_forward_proj {:?}",
                self.feed_forward_proj
            ))
        };
        let (gated, name) = match self.feed_forward_proj.split_once('-') {
            Some(("gated", name)) => (true, name),
            Some(_) => return Err(unsupported()),
            None => (false, self.feed_forward_proj.as_str()),
        };
        let activation = match (gated, name) {
            (_, "relu") => Activation::Relu,
            (true, "gelu") | (_, "gelu_new") => Activation::GeluNew,
            (false, "gelu") => Activation::Gelu,
            _ => return Err(unsupported()),
        };
        Ok((gated, activation))
    }

    fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            d_model: self.d_model as i64,
            d_kv: self.d_kv as i64,
            n_heads: self.num_heads as i64,
            num_buckets: self.relative_attention_num_buckets as i64,
            max_distance: self.relative_attention_max_distance as i64,
            dropout: self.dropout_rate,
            init_factor: self.initializer_factor,
        }
    }
}

fn init_linear(vs: nn::Path, input: usize, output: usize, stdev: f64) -> nn::Linear {
    nn::linear(
        vs,
        input as i64,
        output as i64,
        nn::LinearConfig {
            ws_init: nn::Init::Randn { mean: 0.0, stdev },
            bs_init: None,
            bias: false,
        },
    )
}

#[derive(Debug)]
enum DenseInput {
    Plain(nn::Linear),
    Gated { wi_0: nn::Linear, wi_1: nn::Linear },
}

#[derive(Debug)]
struct T5LayerFF {
    wi: DenseInput,
    wo: nn::Linear,
    layer_norm: T5LayerNorm,
    activation: Activation,
    dropout: f64,
}

impl T5LayerFF {
    fn new(vs: nn::Path, config: &T5Config, gated: bool, activation: Activation) -> Self {
        let dense = &vs / "DenseReluDense";
        let factor = config.initializer_factor;
        let wi_std = factor * (config.d_model as f64).powf(-0.5);
        let wi = match gated {
            true => DenseInput::Gated {
                wi_0: init_linear(&dense / "wi_0", config.d_model, config.d_ff, wi_std),
                wi_1: init_linear(&dense / "wi_1", config.d_model, config.d_ff, wi_std),
            },
            false => DenseInput::Plain(init_linear(
                &dense / "wi",
                config.d_model,
                config.d_ff,
                wi_std,
            )),
        };
        let wo = init_linear(
            &dense / "wo",
            config.d_ff,
            config.d_model,
            factor * (config.d_ff as f64).powf(-0.5),
        );
        let layer_norm = T5LayerNorm::new(
            &vs / "layer_norm",
            config.d_model as i64,
            config.layer_norm_epsilon,
        );
        Self {
            wi,
            wo,
            layer_norm,
            activation,
            dropout: config.dropout_rate,
        }
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Tensor {
        let normed = self.layer_norm.forward(xs);
        let hidden = match &self.wi {
            DenseInput::Plain(wi) => self.activation.apply(&wi.forward(&normed)),
            DenseInput::Gated { wi_0, wi_1 } => {
                self.activation.apply(&wi_0.forward(&normed)) * wi_1.forward(&normed)
            }
        };
        let hidden = self.wo.forward(&hidden.dropout(self.dropout, train));
        xs + hidden.dropout(self.dropout, train)
    }
}

#[derive(Debug)]
struct T5AttentionLayer {
    attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout: f64,
}

impl T5AttentionLayer {
    fn new(
        vs: nn::Path,
        name: &str,
        config: &T5Config,
        is_decoder: bool,
        has_relative_attention_bias: bool,
    ) -> Self {
        Self {
            attention: T5Attention::new(
                &vs / name,
                &config.attention_config(),
                is_decoder,
                has_relative_attention_bias,
            ),
            layer_norm: T5LayerNorm::new(
                &vs / "layer_norm",
                config.d_model as i64,
                config.layer_norm_epsilon,
            ),
            dropout: config.dropout_rate,
        }
    }

    fn forward(
        &self,
        xs: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: &Tensor,
        position_bias: Option<&Tensor>,
        train: bool,
    ) -> (Tensor, Tensor) {
        let normed = self.layer_norm.forward(xs);
        let (attended, position_bias) =
            self.attention
                .forward(&normed, key_value_states, Some(mask), position_bias, train);
        (xs + attended.dropout(self.dropout, train), position_bias)
    }
}

#[derive(Debug)]
struct T5Block {
    self_attention: T5AttentionLayer,
    cross_attention: Option<T5AttentionLayer>,
    feed_forward: T5LayerFF,
}

struct EncoderContext<'a> {
    hidden_states: &'a Tensor,
    mask: &'a Tensor,
}

impl T5Block {
    fn new(
        vs: nn::Path,
        config: &T5Config,
        is_decoder: bool,
        index: usize,
        feed_forward: (bool, Activation),
    ) -> Self {
        let layers = &vs / "layer";
        let self_attention =
            T5AttentionLayer::new(&layers / 0, "SelfAttention", config, is_decoder, index == 0);
        let cross_attention = is_decoder
            .then(|| T5AttentionLayer::new(&layers / 1, "EncDecAttention", config, true, false));
        let ff_index = if is_decoder { 2 } else { 1 };
        let (gated, activation) = feed_forward;
        Self {
            self_attention,
            cross_attention,
            feed_forward: T5LayerFF::new(&layers / ff_index, config, gated, activation),
        }
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        position_bias: Option<&Tensor>,
        encoder: Option<&EncoderContext>,
        cross_position_bias: Option<&Tensor>,
        train: bool,
    ) -> (Tensor, Tensor, Option<Tensor>) {
        let (xs, position_bias) = self
            .self_attention
            .forward(xs, None, mask, position_bias, train);
        let (xs, cross_position_bias) = match (&self.cross_attention, encoder) {
            (Some(cross_attention), Some(encoder)) => {
                let (xs, bias) = cross_attention.forward(
                    &xs,
                    Some(encoder.hidden_states),
                    encoder.mask,
                    cross_position_bias,
                    train,
                );
                (xs, Some(bias))
            }
            _ => (xs, None),
        };
        (
            self.feed_forward.forward(&xs, train),
            position_bias,
            cross_position_bias,
        )
    }
}

/// `[batch, 1, 1, len]` additive mask: 0 where `mask` is 1, a large negative value elsewhere.
fn extended_attention_mask(mask: &Tensor) -> Tensor {
    let size = mask.size();
    (mask.to_kind(Kind::Float).view([size[0], 1, 1, size[1]]) - 1.0) * 1e9
}

/// `[batch, 1, len, len]` additive mask combining padding with no-peeking-ahead.
fn causal_attention_mask(mask: &Tensor) -> Tensor {
    let size = mask.size();
    let (batch, len) = (size[0], size[1]);
    let causal = Tensor::ones([len, len], (Kind::Float, mask.device()))
        .tril(0)
        .view([1, 1, len, len]);
    let allowed = causal * mask.to_kind(Kind::Float).view([batch, 1, 1, len]);
    (allowed - 1.0) * 1e9
}

#[derive(Debug)]
struct T5Stack {
    blocks: Vec<T5Block>,
    final_layer_norm: T5LayerNorm,
    is_decoder: bool,
    dropout: f64,
}

impl T5Stack {
    fn new(
        vs: nn::Path,
        config: &T5Config,
        num_blocks: usize,
        is_decoder: bool,
        feed_forward: (bool, Activation),
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| T5Block::new(&vs / "block" / i, config, is_decoder, i, feed_forward))
            .collect();
        Self {
            blocks,
            final_layer_norm: T5LayerNorm::new(
                &vs / "final_layer_norm",
                config.d_model as i64,
                config.layer_norm_epsilon,
            ),
            is_decoder,
            dropout: config.dropout_rate,
        }
    }

    fn forward(
        &self,
        embeddings: &Tensor,
        attention_mask: &Tensor,
        encoder: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Tensor {
        let self_mask = match self.is_decoder {
            true => causal_attention_mask(attention_mask),
            false => extended_attention_mask(attention_mask),
        };
        let encoder_mask = encoder.map(|(_, mask)| extended_attention_mask(mask));
        let encoder = encoder.zip(encoder_mask.as_ref()).map(|((hidden, _), mask)| {
            EncoderContext {
                hidden_states: hidden,
                mask,
            }
        });

        let mut xs = embeddings.dropout(self.dropout, train);
        let mut position_bias: Option<Tensor> = None;
        let mut cross_position_bias: Option<Tensor> = None;
        for block in &self.blocks {
            let (next, bias, cross_bias) = block.forward(
                &xs,
                &self_mask,
                position_bias.as_ref(),
                encoder.as_ref(),
                cross_position_bias.as_ref(),
                train,
            );
            xs = next;
            position_bias = Some(bias);
            cross_position_bias = cross_bias;
        }
        self.final_layer_norm
            .forward(&xs)
            .dropout(self.dropout, train)
    }
}

#[derive(Debug)]
pub struct T5ForConditionalGeneration {
    config: T5Config,
    shared: nn::Embedding,
    encoder: T5Stack,
    decoder: T5Stack,
    lm_head: Option<nn::Linear>,
    variables: VarStore,
    device: Device,
}

impl T5ForConditionalGeneration {
    /// Builds the model on `device`, then fills its weights from `source` unless `init` asks for
    /// fresh ones.
    pub fn from_source(
        config: &T5Config,
        source: &PretrainedSource<T5Config>,
        init: ModelInit,
        device: Device,
    ) -> Result<Self, ModelLoadError> {
        let feed_forward = config.feed_forward()?;
        if config.num_heads == 0 || config.d_model == 0 {
            return Err(ModelLoadError::UnsupportedConfig(
                "d_model and num_heads must be positive".to_owned(),
            ));
        }

        let mut variables = VarStore::new(device);
        let (shared, encoder, decoder, lm_head) = {
            let _no_grad = tch::no_grad_guard();
            let root = variables.root();
            let shared = nn::embedding(
                &root / "shared",
                config.vocab_size as i64,
                config.d_model as i64,
                nn::EmbeddingConfig {
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: config.initializer_factor,
                    },
                    ..Default::default()
                },
            );
            let encoder = T5Stack::new(
                &root / "encoder",
                config,
                config.num_encoder_layers(),
                false,
                feed_forward,
            );
            let decoder = T5Stack::new(
                &root / "decoder",
                config,
                config.num_decoder_layers(),
                true,
                feed_forward,
            );
            let lm_head = (!config.tie_word_embeddings).then(|| {
                init_linear(
                    &root / "lm_head",
                    config.d_model,
                    config.vocab_size,
                    config.initializer_factor,
                )
            });
            (shared, encoder, decoder, lm_head)
        };

        match init {
            ModelInit::Pretrained => source.load(&mut variables)?,
            ModelInit::FromConfig => debug!("Initializing T5 weights from config"),
        }

        Ok(Self {
            config: config.clone(),
            shared,
            encoder,
            decoder,
            lm_head,
            variables,
            device,
        })
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    fn layers(&self, stack: &str, count: usize) -> Vec<LayerParameters> {
        (0..count)
            .map(|i| LayerParameters::from_prefix(&self.variables, &format!("{stack}.block.{i}")))
            .collect()
    }
}

impl Seq2SeqLM for T5ForConditionalGeneration {
    fn forward(&self, inputs: &Seq2SeqTensors, train: bool) -> (Tensor, Option<Tensor>) {
        let encoder_hidden = self.encoder.forward(
            &self.shared.forward(&inputs.input_ids),
            &inputs.attention_mask,
            None,
            train,
        );
        let decoder_hidden = self.decoder.forward(
            &self.shared.forward(&inputs.decoder_input_ids),
            &inputs.decoder_attention_mask,
            Some((&encoder_hidden, &inputs.attention_mask)),
            train,
        );
        let logits = match &self.lm_head {
            Some(lm_head) => lm_head.forward(&decoder_hidden),
            // tied embeddings are rescaled before projecting back onto the vocabulary
            None => (decoder_hidden * (self.config.d_model as f64).powf(-0.5))
                .matmul(&self.shared.ws.tr()),
        };
        let loss = inputs.labels.as_ref().map(|labels| {
            logits
                .to_kind(Kind::Float)
                .view([-1, self.config.vocab_size as i64])
                .cross_entropy_loss::<Tensor>(
                    &labels.view(-1).to_kind(Kind::Int64),
                    None,
                    tch::Reduction::Mean,
                    -100,
                    0.0,
                )
        });
        (logits, loss)
    }

    fn encoder_layers(&self) -> Vec<LayerParameters> {
        self.layers("encoder", self.config.num_encoder_layers())
    }

    fn decoder_layers(&self) -> Vec<LayerParameters> {
        self.layers("decoder", self.config.num_decoder_layers())
    }

    fn head_parameters(&self) -> Vec<Tensor> {
        match &self.lm_head {
            Some(lm_head) => vec![lm_head.ws.shallow_clone()],
            None => vec![self.shared.ws.shallow_clone()],
        }
    }

    fn untie_head(&mut self) -> Result<(), TchError> {
        if self.lm_head.is_some() {
            return Ok(());
        }
        // folds the tied-embedding rescale into the new weight
        let scale = (self.config.d_model as f64).powf(-0.5);
        let weight = tch::no_grad(|| self.shared.ws.f_mul_scalar(scale))?;
        let ws = (&self.variables.root() / "lm_head").var_copy("weight", &weight);
        self.lm_head = Some(nn::Linear { ws, bs: None });
        self.config.tie_word_embeddings = false;
        debug!("Untied lm_head from the shared embedding");
        Ok(())
    }

    fn variables(&self) -> &VarStore {
        &self.variables
    }

    fn device(&self) -> Device {
        self.device
    }

    fn config_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.config)
    }
}

#[cfg(test)]
pub(crate) fn tiny_config() -> T5Config {
    T5Config {
        vocab_size: 16,
        d_model: 8,
        d_kv: 4,
        d_ff: 12,
        num_layers: 2,
        num_decoder_layers: Some(3),
        num_heads: 2,
        relative_attention_num_buckets: 8,
        relative_attention_max_distance: 16,
        dropout_rate: 0.0,
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) fn tiny_inputs(labels: bool) -> Seq2SeqTensors {
    let input_ids = Tensor::from_slice2(&[[5i64, 6, 7, 1], [8, 9, 1, 0]]);
    let attention_mask = Tensor::from_slice2(&[[1i64, 1, 1, 1], [1, 1, 1, 0]]);
    let decoder_input_ids = Tensor::from_slice2(&[[0i64, 5, 6, 7], [0, 8, 9, 1]]);
    Seq2SeqTensors {
        labels: labels.then(|| Tensor::from_slice2(&[[5i64, 6, 7, 1], [8, 9, 1, -100]])),
        input_ids,
        decoder_attention_mask: attention_mask.shallow_clone(),
        attention_mask,
        decoder_input_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::{collections::HashMap, sync::Arc};

    fn fresh(config: &T5Config) -> T5ForConditionalGeneration {
        let source = PretrainedSource::ConfigAndTensors(config.clone(), Arc::new(HashMap::new()));
        T5ForConditionalGeneration::from_source(config, &source, ModelInit::FromConfig, Device::Cpu)
            .unwrap()
    }

    #[rstest]
    #[case("relu", Ok((false, Activation::Relu)))]
    #[case("gated-gelu", Ok((true, Activation::GeluNew)))]
    #[case("gelu", Ok((false, Activation::Gelu)))]
    #[case("gated-relu", Ok((true, Activation::Relu)))]
    #[case("swish", Err(()))]
    #[case("double-relu", Err(()))]
    fn feed_forward_proj_parsing(
        #[case] proj: &str,
        #[case] expected: Result<(bool, Activation), ()>,
    ) {
        let config = T5Config {
            feed_forward_proj: proj.to_owned(),
            ..Default::default()
        };
        assert_eq!(config.feed_forward().map_err(|_| ()), expected);
    }

    #[test]
    fn parameters_use_hugging_face_names() {
        let model = fresh(&tiny_config());
        let names = model.variables().variables();
        for name in [
            "shared.weight",
            "encoder.block.0.layer.0.SelfAttention.q.weight",
            "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
            "encoder.block.1.layer.1.DenseReluDense.wi.weight",
            "encoder.final_layer_norm.weight",
            "decoder.block.2.layer.1.EncDecAttention.o.weight",
            "decoder.block.2.layer.2.DenseReluDense.wo.weight",
            "decoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
        ] {
            assert!(names.contains_key(name), "missing {name}");
        }
        assert!(!names
            .contains_key("encoder.block.1.layer.0.SelfAttention.relative_attention_bias.weight"));
        assert!(!names.contains_key("lm_head.weight"));
    }

    #[test]
    fn layers_are_grouped_per_block() {
        let model = fresh(&tiny_config());
        let encoder = model.encoder_layers();
        let decoder = model.decoder_layers();
        assert_eq!(encoder.len(), 2);
        assert_eq!(decoder.len(), 3);
        assert_eq!(decoder[1].name, "decoder.block.1");
        // q, k, v, o, norm, wi, wo, norm
        assert_eq!(encoder[1].parameters.len(), 8);
        // the first block also owns the relative attention bias
        assert_eq!(encoder[0].parameters.len(), 9);
        // plus cross attention and its norm
        assert_eq!(decoder[1].parameters.len(), 13);
    }

    #[test]
    fn forward_produces_logits_and_loss() {
        let model = fresh(&tiny_config());
        let (logits, loss) = model.forward(&tiny_inputs(true), false);
        assert_eq!(logits.size(), vec![2, 4, 16]);
        let loss = loss.unwrap().double_value(&[]);
        assert!(loss.is_finite() && loss > 0.0);

        let (_, loss) = model.forward(&tiny_inputs(false), false);
        assert!(loss.is_none());
    }

    #[test]
    fn untied_head_gets_its_own_parameter() {
        let config = T5Config {
            tie_word_embeddings: false,
            feed_forward_proj: "gated-gelu".to_owned(),
            ..tiny_config()
        };
        let model = fresh(&config);
        let names = model.variables().variables();
        assert!(names.contains_key("lm_head.weight"));
        assert!(names.contains_key("encoder.block.0.layer.1.DenseReluDense.wi_1.weight"));
        assert_eq!(model.head_parameters()[0].size(), vec![16, 8]);
        let (logits, _) = model.forward(&tiny_inputs(false), false);
        assert_eq!(logits.size(), vec![2, 4, 16]);
    }

    #[test]
    fn untied_head_keeps_logits_and_config() {
        let mut model = fresh(&tiny_config());
        let inputs = tiny_inputs(false);
        let (before, _) = model.forward(&inputs, false);

        model.untie_head().unwrap();
        let names = model.variables().variables();
        assert!(names.contains_key("lm_head.weight"));
        assert!(!model.config().tie_word_embeddings);
        let head = model.head_parameters();
        assert_eq!(head.len(), 1);
        assert_ne!(head[0].data_ptr(), names["shared.weight"].data_ptr());

        let (after, _) = model.forward(&inputs, false);
        assert!(before.allclose(&after, 1e-5, 1e-5, false));

        // a second call leaves the existing head alone
        model.untie_head().unwrap();
        assert_eq!(model.head_parameters()[0].data_ptr(), head[0].data_ptr());
    }

    #[test]
    fn weights_load_from_tensor_map() {
        let config = tiny_config();
        let original = fresh(&config);
        let tensors = original
            .variables()
            .variables()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.detach().copy()))
            .collect::<HashMap<_, _>>();
        let source = PretrainedSource::ConfigAndTensors(config.clone(), Arc::new(tensors));
        let loaded =
            T5ForConditionalGeneration::from_source(&config, &source, ModelInit::Pretrained, Device::Cpu)
                .unwrap();

        let inputs = tiny_inputs(false);
        let (a, _) = original.forward(&inputs, false);
        let (b, _) = loaded.forward(&inputs, false);
        assert!(a.allclose(&b, 1e-5, 1e-5, false));
    }

    #[test]
    fn pretrained_init_requires_every_weight() {
        let config = tiny_config();
        let source = PretrainedSource::ConfigAndTensors(config.clone(), Arc::new(HashMap::new()));
        assert!(matches!(
            T5ForConditionalGeneration::from_source(&config, &source, ModelInit::Pretrained, Device::Cpu),
            Err(ModelLoadError::LoadTensorError(_))
        ));
    }
}
