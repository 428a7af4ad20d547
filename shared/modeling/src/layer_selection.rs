use crate::{LayerParameters, Seq2SeqLM};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tch::TchError;
use thiserror::Error;
use tracing::info;

/// Which attention blocks receive gradients.
///
/// Deserializes from `null` ([`Frozen`](LayerSelection::Frozen)), an integer
/// ([`Total`](LayerSelection::Total)) or a two-element array
/// ([`PerSection`](LayerSelection::PerSection)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerSelection {
    /// Every model parameter is frozen; only a task head on top is expected to learn.
    #[default]
    Frozen,
    /// The last `n` blocks of the combined encoder-then-decoder sequence. `n <= 0` is
    /// equivalent to [`Frozen`](LayerSelection::Frozen).
    Total(i64),
    /// The last `encoder` encoder blocks and the last `decoder` decoder blocks, where `-1` means
    /// every block of that section.
    PerSection(i64, i64),
}

impl From<i64> for LayerSelection {
    fn from(n: i64) -> Self {
        Self::Total(n)
    }
}

impl From<(i64, i64)> for LayerSelection {
    fn from((encoder, decoder): (i64, i64)) -> Self {
        Self::PerSection(encoder, decoder)
    }
}

impl From<Option<i64>> for LayerSelection {
    fn from(n: Option<i64>) -> Self {
        n.map(Self::Total).unwrap_or_default()
    }
}

impl Display for LayerSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerSelection::Frozen => write!(f, "none"),
            LayerSelection::Total(n) => write!(f, "{n}"),
            LayerSelection::PerSection(encoder, decoder) => write!(f, "{encoder},{decoder}"),
        }
    }
}

impl std::str::FromStr for LayerSelection {
    type Err = String;

    /// Parses `none`, `n` or `e,d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |x: &str| {
            x.trim()
                .parse::<i64>()
                .map_err(|e| format!("invalid layer count {x:?}: {e}"))
        };
        match s.trim() {
            "" | "none" => Ok(Self::Frozen),
            s => match s.split_once(',') {
                Some((encoder, decoder)) => Ok(Self::PerSection(parse(encoder)?, parse(decoder)?)),
                None => Ok(Self::Total(parse(s)?)),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Encoder,
    Decoder,
}

impl Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Section::Encoder => write!(f, "encoder"),
            Section::Decoder => write!(f, "decoder"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayerSelectionError {
    #[error(
        "You must select a number of layers to train no greater than the total number of layers \
         in the model. You selected {requested}; there are {available} attention layers available."
    )]
    TooManyLayers { requested: i64, available: usize },

    #[error("requested {requested} {section} layers, but the model only has {available}")]
    SectionTooLarge {
        section: Section,
        requested: i64,
        available: usize,
    },

    #[error("invalid {section} layer count {requested}; use -1 to train every layer")]
    NegativeCount { section: Section, requested: i64 },
}

/// Resolved per-section trainable counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainablePlan {
    pub encoder: usize,
    pub decoder: usize,
    /// Freeze every model parameter, not just the unselected blocks. The LM head is the task
    /// head that keeps learning.
    pub freeze_backbone: bool,
}

impl TrainablePlan {
    pub fn total(&self) -> usize {
        self.encoder + self.decoder
    }
}

fn section_count(
    section: Section,
    requested: i64,
    available: usize,
) -> Result<usize, LayerSelectionError> {
    match requested {
        -1 => Ok(available),
        n if n < 0 => Err(LayerSelectionError::NegativeCount { section, requested }),
        n if n as usize > available => Err(LayerSelectionError::SectionTooLarge {
            section,
            requested,
            available,
        }),
        n => Ok(n as usize),
    }
}

impl LayerSelection {
    /// Validates the selection against a model with `num_encoder` and `num_decoder` blocks.
    pub fn plan(
        &self,
        num_encoder: usize,
        num_decoder: usize,
    ) -> Result<TrainablePlan, LayerSelectionError> {
        match *self {
            LayerSelection::PerSection(encoder, decoder) => Ok(TrainablePlan {
                encoder: section_count(Section::Encoder, encoder, num_encoder)?,
                decoder: section_count(Section::Decoder, decoder, num_decoder)?,
                freeze_backbone: false,
            }),
            LayerSelection::Total(n) if n > 0 => {
                let available = num_encoder + num_decoder;
                if n as usize > available {
                    return Err(LayerSelectionError::TooManyLayers {
                        requested: n,
                        available,
                    });
                }
                let decoder = (n as usize).min(num_decoder);
                Ok(TrainablePlan {
                    encoder: n as usize - decoder,
                    decoder,
                    freeze_backbone: false,
                })
            }
            LayerSelection::Total(_) | LayerSelection::Frozen => Ok(TrainablePlan {
                encoder: 0,
                decoder: 0,
                freeze_backbone: true,
            }),
        }
    }
}

/// Marks the last `count` of `layers` trainable and the rest frozen, logging each block.
pub fn toggle_layers(layers: &[LayerParameters], count: usize, section: Section) {
    let first_trainable = layers.len().saturating_sub(count);
    for (index, layer) in layers.iter().enumerate() {
        let trainable = index >= first_trainable;
        layer.set_trainable(trainable);
        info!(
            section = %section,
            layer = index,
            "{}",
            if trainable { "ON" } else { "OFF" }
        );
    }
}

/// Applies an already-validated plan to `model`'s parameters.
///
/// Freezing the backbone unties a tied LM head first, so the input embedding is frozen along
/// with everything else.
pub fn apply_trainable_plan(
    model: &mut dyn Seq2SeqLM,
    plan: &TrainablePlan,
) -> Result<(), TchError> {
    if plan.freeze_backbone {
        model.untie_head()?;
        for (_, parameter) in model.variables().variables() {
            let _ = parameter.set_requires_grad(false);
        }
        for parameter in model.head_parameters() {
            let _ = parameter.set_requires_grad(true);
        }
    }
    toggle_layers(&model.encoder_layers(), plan.encoder, Section::Encoder);
    toggle_layers(&model.decoder_layers(), plan.decoder, Section::Decoder);
    Ok(())
}
