use crate::Seq2SeqTensors;
use anyhow::{anyhow, bail, Result};
use apteryx_data_provider::Collator;
use tch::{Device, Tensor};
use tokenizers::Tokenizer;

/// Label value ignored by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// A padded batch of token ids, still on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seq2SeqBatch {
    pub input_ids: Vec<Vec<i64>>,
    pub attention_mask: Vec<Vec<i64>>,
    pub decoder_input_ids: Vec<Vec<i64>>,
    pub decoder_attention_mask: Vec<Vec<i64>>,
    pub labels: Vec<Vec<i64>>,
}

impl Seq2SeqBatch {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    pub fn to_tensors(&self, device: Device) -> Seq2SeqTensors {
        let to = |rows: &Vec<Vec<i64>>| Tensor::from_slice2(rows).to(device);
        Seq2SeqTensors {
            input_ids: to(&self.input_ids),
            attention_mask: to(&self.attention_mask),
            decoder_input_ids: to(&self.decoder_input_ids),
            decoder_attention_mask: to(&self.decoder_attention_mask),
            labels: Some(to(&self.labels)),
        }
    }
}

/// Pads `sequences` to the longest one and derives the autoencoding targets.
///
/// Labels are the inputs with padding replaced by [`IGNORE_INDEX`]; decoder inputs are the
/// labels shifted one step right behind `decoder_start_token_id`.
pub fn collate_token_ids(
    sequences: Vec<Vec<i64>>,
    pad_token_id: i64,
    decoder_start_token_id: i64,
) -> Seq2SeqBatch {
    let max_len = sequences.iter().map(|x| x.len()).max().unwrap_or(0);
    let mut batch = Seq2SeqBatch {
        input_ids: Vec::with_capacity(sequences.len()),
        attention_mask: Vec::with_capacity(sequences.len()),
        decoder_input_ids: Vec::with_capacity(sequences.len()),
        decoder_attention_mask: Vec::with_capacity(sequences.len()),
        labels: Vec::with_capacity(sequences.len()),
    };
    for ids in sequences {
        let padding = max_len - ids.len();

        let mut mask = vec![1; ids.len()];
        mask.resize(max_len, 0);

        let mut labels = ids.clone();
        labels.resize(max_len, IGNORE_INDEX);

        let mut decoder_input_ids = Vec::with_capacity(max_len);
        decoder_input_ids.push(decoder_start_token_id);
        decoder_input_ids.extend(labels.iter().take(max_len.saturating_sub(1)).map(|&x| {
            match x {
                IGNORE_INDEX => pad_token_id,
                x => x,
            }
        }));
        decoder_input_ids.truncate(max_len);

        let mut input_ids = ids;
        input_ids.extend(std::iter::repeat(pad_token_id).take(padding));

        batch.input_ids.push(input_ids);
        batch.decoder_attention_mask.push(mask.clone());
        batch.attention_mask.push(mask);
        batch.decoder_input_ids.push(decoder_input_ids);
        batch.labels.push(labels);
    }
    batch
}

/// Tokenizes raw text into autoencoding batches: each example is both the encoder input and
/// the decoder target.
pub struct Seq2SeqCollator {
    tokenizer: Tokenizer,
    block_size: usize,
    pad_token_id: i64,
    eos_token_id: i64,
    decoder_start_token_id: i64,
}

impl std::fmt::Debug for Seq2SeqCollator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seq2SeqCollator")
            .field("block_size", &self.block_size)
            .field("pad_token_id", &self.pad_token_id)
            .field("eos_token_id", &self.eos_token_id)
            .field("decoder_start_token_id", &self.decoder_start_token_id)
            .finish()
    }
}

impl Seq2SeqCollator {
    pub fn new(
        tokenizer: Tokenizer,
        block_size: usize,
        pad_token_id: i64,
        eos_token_id: i64,
        decoder_start_token_id: i64,
    ) -> Self {
        Self {
            tokenizer,
            block_size,
            pad_token_id,
            eos_token_id,
            decoder_start_token_id,
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Token ids for `text` with special tokens, cut to `block_size`. A cut sequence still ends
    /// in EOS.
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("failed to tokenize example: {e}"))?;
        let mut ids = encoding
            .get_ids()
            .iter()
            .map(|&x| x as i64)
            .collect::<Vec<_>>();
        if ids.len() > self.block_size {
            ids.truncate(self.block_size);
            if let Some(last) = ids.last_mut() {
                *last = self.eos_token_id;
            }
        }
        if ids.is_empty() {
            ids.push(self.eos_token_id);
        }
        Ok(ids)
    }
}

impl Collator<String> for Seq2SeqCollator {
    type Batch = Seq2SeqBatch;

    fn collate(&self, items: Vec<String>) -> Result<Seq2SeqBatch> {
        if items.is_empty() {
            bail!("cannot collate an empty batch");
        }
        let sequences = items
            .iter()
            .map(|text| self.encode(text))
            .collect::<Result<Vec<_>>>()?;
        Ok(collate_token_ids(
            sequences,
            self.pad_token_id,
            self.decoder_start_token_id,
        ))
    }
}

/// A whitespace word-level tokenizer over a 16-token vocabulary that appends `</s>`.
#[cfg(test)]
pub(crate) fn tiny_tokenizer_json() -> String {
    let words = [
        "<pad>", "</s>", "<unk>", "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog",
        "a", "cat", "sat", "on", "mat",
    ];
    let vocab = words
        .iter()
        .enumerate()
        .map(|(i, word)| (word.to_string(), serde_json::json!(i)))
        .collect::<serde_json::Map<_, _>>();
    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}}
            ],
            "pair": [
                {"Sequence": {"id": "A", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}},
                {"Sequence": {"id": "B", "type_id": 0}},
                {"SpecialToken": {"id": "</s>", "type_id": 0}}
            ],
            "special_tokens": {
                "</s>": {"id": "</s>", "ids": [1], "tokens": ["</s>"]}
            }
        },
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn pads_masks_and_shifts() {
        let batch = collate_token_ids(vec![vec![5, 6, 7, 1], vec![8, 1]], 0, 0);
        assert_eq!(
            batch,
            Seq2SeqBatch {
                input_ids: vec![vec![5, 6, 7, 1], vec![8, 1, 0, 0]],
                attention_mask: vec![vec![1, 1, 1, 1], vec![1, 1, 0, 0]],
                decoder_input_ids: vec![vec![0, 5, 6, 7], vec![0, 8, 1, 0]],
                decoder_attention_mask: vec![vec![1, 1, 1, 1], vec![1, 1, 0, 0]],
                labels: vec![vec![5, 6, 7, 1], vec![8, 1, -100, -100]],
            }
        );
    }

    #[test]
    fn decoder_start_token_is_configurable() {
        let batch = collate_token_ids(vec![vec![3, 1]], 0, 2);
        assert_eq!(batch.decoder_input_ids, vec![vec![2, 3]]);
    }

    fn collator(block_size: usize) -> Seq2SeqCollator {
        let tokenizer = Tokenizer::from_str(&tiny_tokenizer_json()).unwrap();
        Seq2SeqCollator::new(tokenizer, block_size, 0, 1, 0)
    }

    #[test]
    fn tokenizes_with_eos() {
        assert_eq!(collator(16).encode("the quick fox").unwrap(), vec![3, 4, 6, 1]);
        assert_eq!(collator(16).encode("the zebra").unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn truncation_keeps_eos_last() {
        assert_eq!(
            collator(3).encode("the quick brown fox").unwrap(),
            vec![3, 4, 1]
        );
    }

    #[test]
    fn collates_text() {
        let batch = collator(8)
            .collate(vec!["a cat sat".to_owned(), "the dog".to_owned()])
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.input_ids, vec![vec![11, 12, 13, 1], vec![3, 10, 1, 0]]);
        assert_eq!(batch.labels[1], vec![3, 10, 1, -100]);

        let tensors = batch.to_tensors(Device::Cpu);
        assert_eq!(tensors.input_ids.size(), vec![2, 4]);
        assert_eq!(tensors.labels.unwrap().size(), vec![2, 4]);
    }

    #[test]
    fn empty_batch_is_an_error() {
        assert!(collator(8).collate(vec![]).is_err());
    }
}
