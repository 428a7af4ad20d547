use anyhow::{bail, Context, Result};
use apteryx_core::{Overrides, Shuffle};
use apteryx_data_provider::LocalTextDataset;
use apteryx_logging::{init_logging, LogOutput};
use apteryx_modeling::{
    AutoencoderArgs, LayerSelection, ModelInit, T5Family, TransformerAutoencoder,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use tch::Device;
use tracing::{info, Level};

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, default_value = "t5-small")]
    model: String,

    /// Directory of `.txt` / `.jsonl` files, one example per line.
    #[arg(long, default_value = "data")]
    data_path: PathBuf,

    #[arg(long)]
    max_examples: Option<usize>,

    #[arg(long, default_value_t = 128)]
    block_size: usize,

    #[arg(long, default_value_t = 0.8)]
    train_pct: f64,

    /// `none`, a total count `n`, or per-section `encoder,decoder` (`-1` for every block).
    #[arg(long, default_value = "-1,-1", allow_hyphen_values = true)]
    layers: LayerSelection,

    /// TOML or JSON file of model config overrides.
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// TOML or JSON file of training argument overrides.
    #[arg(long)]
    training_args: Option<PathBuf>,

    /// Start from randomly initialized weights instead of the pretrained checkpoint.
    #[arg(long, default_value_t = false)]
    from_config: bool,

    #[arg(long)]
    split_seed: Option<u64>,

    #[arg(long, default_value_t = false)]
    cpu: bool,

    #[arg(long, value_enum, default_value_t = LogOutput::Console)]
    log_output: LogOutput,

    #[arg(long)]
    write_log: Option<PathBuf>,
}

fn read_overrides(path: &Path) -> Result<Overrides> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read overrides from {}", path.display()))?;
    let value = match path.extension().and_then(|x| x.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        Some("toml") => serde_json::to_value(toml::from_str::<toml::Table>(&contents)?)?,
        _ => bail!("overrides file {} must be .toml or .json", path.display()),
    };
    match value {
        serde_json::Value::Object(overrides) => Ok(overrides),
        _ => bail!("overrides file {} is not a table", path.display()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_output, Level::INFO, args.write_log.clone())?;

    info!(
        "starting autoencoder run: model {}, data_path {}, block_size {}, train_pct {}, layers {}, from_config {}",
        args.model,
        args.data_path.display(),
        args.block_size,
        args.train_pct,
        args.layers,
        args.from_config,
    );

    let dataset = LocalTextDataset::new_from_directory(&args.data_path, args.max_examples)?;

    let mut autoencoder_args = AutoencoderArgs::new(&args.model, args.block_size);
    autoencoder_args.train_pct = args.train_pct;
    autoencoder_args.layers = args.layers;
    if let Some(path) = &args.model_config {
        autoencoder_args.model_config = read_overrides(path)?;
    }
    if let Some(path) = &args.training_args {
        autoencoder_args.training_args = read_overrides(path)?;
    }
    if args.from_config {
        autoencoder_args.init = ModelInit::FromConfig;
    }
    if let Some(seed) = args.split_seed {
        autoencoder_args.split = Shuffle::from_u64(seed);
    }
    if args.cpu {
        autoencoder_args.device = Device::Cpu;
    }

    let mut autoencoder = TransformerAutoencoder::new(T5Family, dataset, autoencoder_args)?;
    let output = autoencoder.train()?;
    info!(
        global_step = output.global_step,
        training_loss = output.training_loss,
        eval_loss = output.eval_loss,
        "Done"
    );
    Ok(())
}
