use tch::{
    nn::{self, Module},
    Device, Kind, Tensor,
};

/// Maps a key-minus-query offset to one of `num_buckets` relative-position buckets.
///
/// Half the buckets (all of them when unidirectional) cover exact small offsets, the rest grow
/// logarithmically up to `max_distance`, beyond which everything shares the last bucket.
/// Bidirectional attention keeps positive offsets in the upper half.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: i64,
    max_distance: i64,
) -> i64 {
    let (num_buckets, mut bucket, distance) = match bidirectional {
        true => {
            let half = num_buckets / 2;
            let offset = if relative_position > 0 { half } else { 0 };
            (half, offset, relative_position.abs())
        }
        false => (num_buckets, 0, -relative_position.min(0)),
    };

    let max_exact = num_buckets / 2;
    bucket += if distance < max_exact {
        distance
    } else {
        let scaled = (distance as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64;
        (max_exact + scaled as i64).min(num_buckets - 1)
    };
    bucket
}

#[derive(Debug)]
pub struct T5Attention {
    q: nn::Linear,
    k: nn::Linear,
    v: nn::Linear,
    o: nn::Linear,
    relative_attention_bias: Option<nn::Embedding>,
    n_heads: i64,
    d_kv: i64,
    bidirectional: bool,
    num_buckets: i64,
    max_distance: i64,
    dropout: f64,
}

pub struct AttentionConfig {
    pub d_model: i64,
    pub d_kv: i64,
    pub n_heads: i64,
    pub num_buckets: i64,
    pub max_distance: i64,
    pub dropout: f64,
    pub init_factor: f64,
}

fn projection(vs: nn::Path, input: i64, output: i64, stdev: f64) -> nn::Linear {
    nn::linear(
        vs,
        input,
        output,
        nn::LinearConfig {
            ws_init: nn::Init::Randn { mean: 0.0, stdev },
            bs_init: None,
            bias: false,
        },
    )
}

impl T5Attention {
    pub fn new(
        vs: nn::Path,
        config: &AttentionConfig,
        is_decoder: bool,
        has_relative_attention_bias: bool,
    ) -> Self {
        let inner_dim = config.n_heads * config.d_kv;
        let factor = config.init_factor;
        let q = projection(
            &vs / "q",
            config.d_model,
            inner_dim,
            factor * ((config.d_model * config.d_kv) as f64).powf(-0.5),
        );
        let k = projection(
            &vs / "k",
            config.d_model,
            inner_dim,
            factor * (config.d_model as f64).powf(-0.5),
        );
        let v = projection(
            &vs / "v",
            config.d_model,
            inner_dim,
            factor * (config.d_model as f64).powf(-0.5),
        );
        let o = projection(
            &vs / "o",
            inner_dim,
            config.d_model,
            factor * (inner_dim as f64).powf(-0.5),
        );
        let relative_attention_bias = has_relative_attention_bias.then(|| {
            nn::embedding(
                &vs / "relative_attention_bias",
                config.num_buckets,
                config.n_heads,
                nn::EmbeddingConfig {
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: factor * (config.d_model as f64).powf(-0.5),
                    },
                    ..Default::default()
                },
            )
        });
        Self {
            q,
            k,
            v,
            o,
            relative_attention_bias,
            n_heads: config.n_heads,
            d_kv: config.d_kv,
            bidirectional: !is_decoder,
            num_buckets: config.num_buckets,
            max_distance: config.max_distance,
            dropout: config.dropout,
        }
    }

    /// `[1, n_heads, query_len, key_len]` bias from the learned relative-position table.
    fn compute_bias(&self, query_len: i64, key_len: i64, device: Device) -> Tensor {
        let Some(table) = &self.relative_attention_bias else {
            return Tensor::zeros([1, self.n_heads, query_len, key_len], (Kind::Float, device));
        };
        let buckets = (0..query_len)
            .flat_map(|query| {
                (0..key_len).map(move |key| {
                    relative_position_bucket(
                        key - query,
                        self.bidirectional,
                        self.num_buckets,
                        self.max_distance,
                    )
                })
            })
            .collect::<Vec<_>>();
        let buckets = Tensor::from_slice(&buckets)
            .view([query_len, key_len])
            .to(device);
        table
            .forward(&buckets)
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
    }

    fn shape(&self, xs: &Tensor, batch: i64) -> Tensor {
        xs.view([batch, -1, self.n_heads, self.d_kv]).transpose(1, 2)
    }

    /// Attends from `hidden_states` to `key_value_states` (itself for self-attention).
    ///
    /// Returns the output and the position bias with `mask` folded in, so later blocks in the
    /// same stack can reuse it.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        key_value_states: Option<&Tensor>,
        mask: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        train: bool,
    ) -> (Tensor, Tensor) {
        let size = hidden_states.size();
        let (batch, query_len) = (size[0], size[1]);
        let key_value_states = key_value_states.unwrap_or(hidden_states);
        let key_len = key_value_states.size()[1];

        let q = self.shape(&self.q.forward(hidden_states), batch);
        let k = self.shape(&self.k.forward(key_value_states), batch);
        let v = self.shape(&self.v.forward(key_value_states), batch);

        // T5 folds the 1/sqrt(d) scale into its initialization
        let scores = q.matmul(&k.transpose(-1, -2));

        let position_bias = match position_bias {
            Some(bias) => bias.shallow_clone(),
            None => {
                let bias = self.compute_bias(query_len, key_len, hidden_states.device());
                match mask {
                    Some(mask) => bias + mask,
                    None => bias,
                }
            }
        };

        let scores = scores.to_kind(Kind::Float) + &position_bias;
        let weights = scores
            .softmax(-1, Kind::Float)
            .to_kind(v.kind())
            .dropout(self.dropout, train);
        let output = weights
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([batch, -1, self.n_heads * self.d_kv]);
        (self.o.forward(&output), position_bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tch::nn::VarStore;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 17)]
    #[case(-1, 1)]
    #[case(7, 23)]
    #[case(-8, 8)]
    #[case(-127, 15)]
    #[case(-200, 15)]
    #[case(500, 31)]
    fn bidirectional_buckets(#[case] relative: i64, #[case] expected: i64) {
        assert_eq!(relative_position_bucket(relative, true, 32, 128), expected);
    }

    #[rstest]
    #[case(5, 0)]
    #[case(0, 0)]
    #[case(-1, 1)]
    #[case(-15, 15)]
    #[case(-20, 17)]
    #[case(-1000, 31)]
    fn unidirectional_buckets_ignore_future(#[case] relative: i64, #[case] expected: i64) {
        assert_eq!(relative_position_bucket(relative, false, 32, 128), expected);
    }

    #[test]
    fn buckets_never_leave_range() {
        for relative in -2000..2000 {
            let bucket = relative_position_bucket(relative, true, 32, 128);
            assert!((0..32).contains(&bucket), "{relative} -> {bucket}");
        }
    }

    fn config() -> AttentionConfig {
        AttentionConfig {
            d_model: 8,
            d_kv: 2,
            n_heads: 4,
            num_buckets: 8,
            max_distance: 16,
            dropout: 0.0,
            init_factor: 1.0,
        }
    }

    #[test]
    fn output_keeps_query_shape() {
        let vs = VarStore::new(Device::Cpu);
        let attention = T5Attention::new(vs.root() / "attn", &config(), false, true);
        let hidden = Tensor::randn([2, 5, 8], (Kind::Float, Device::Cpu));
        let memory = Tensor::randn([2, 3, 8], (Kind::Float, Device::Cpu));

        let (out, bias) = attention.forward(&hidden, None, None, None, false);
        assert_eq!(out.size(), vec![2, 5, 8]);
        assert_eq!(bias.size(), vec![1, 4, 5, 5]);

        let (out, bias) = attention.forward(&hidden, Some(&memory), None, None, false);
        assert_eq!(out.size(), vec![2, 5, 8]);
        assert_eq!(bias.size(), vec![1, 4, 5, 3]);
    }

    #[test]
    fn masked_keys_do_not_change_output() {
        let vs = VarStore::new(Device::Cpu);
        let attention = T5Attention::new(vs.root() / "attn", &config(), false, false);
        let hidden = Tensor::randn([1, 4, 8], (Kind::Float, Device::Cpu));
        let mask = Tensor::from_slice(&[0.0f32, 0.0, 0.0, -1e9]).view([1, 1, 1, 4]);

        let (masked, _) = attention.forward(&hidden, None, Some(&mask), None, false);
        let noise = Tensor::zeros([1, 4, 8], (Kind::Float, Device::Cpu));
        let _ = noise.narrow(1, 3, 1).fill_(100.0);
        let perturbed = &hidden + noise;
        let (masked_perturbed, _) = attention.forward(&perturbed, None, Some(&mask), None, false);

        // queries 0..3 never look at the last key, so only its own row may change
        let diff = (masked.narrow(1, 0, 3) - masked_perturbed.narrow(1, 0, 3))
            .abs()
            .max()
            .double_value(&[]);
        assert!(diff < 1e-4, "{diff}");
    }
}
