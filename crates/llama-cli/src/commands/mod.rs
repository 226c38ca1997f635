//! CLI command implementations.

pub mod generate;
pub mod info;
pub mod inspect;
pub mod score;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use candle_core::Device;
use clap::Args;
use llama_core::{DeviceConfig, TextTokenizer};
use llama_model::{Llama, ModelConfig};
use text_tokenizer::Tokenizer;
use tracing::info;

/// Where the model comes from and where it runs.
#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    /// Architecture configuration (JSON)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Safetensors checkpoint; random weights are used when omitted
    #[arg(short, long)]
    pub weights: Option<PathBuf>,

    /// Seed for random weights and for sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Compute device (auto, cpu, cuda, metal)
    #[arg(long, default_value = "auto")]
    pub device: String,

    /// Accelerator ordinal
    #[arg(long)]
    pub gpu_index: Option<usize>,
}

impl ModelArgs {
    /// Resolve the compute device.
    pub fn device(&self) -> Result<Device> {
        let config = DeviceConfig {
            device_type: runtime::device::parse_device_type(&self.device)?,
            gpu_index: self.gpu_index,
        };
        Ok(runtime::select_device(&config)?)
    }

    /// Read the configuration and build the model on `device`.
    pub fn load(&self, device: &Device) -> Result<Llama> {
        let config = ModelConfig::from_file(&self.config)
            .with_context(|| format!("reading {}", self.config.display()))?;
        let model = match &self.weights {
            Some(path) => Llama::load(path, config, device)?,
            None => {
                let seed = self.seed.unwrap_or(0);
                info!(seed, "No checkpoint given, using random weights");
                let weights = llama_model::random_init(&config, seed, device)?;
                Llama::from_weight_map(config, weights, device)?
            }
        };
        Ok(model)
    }
}

/// The token sequence to run: tokenized text or raw ids.
#[derive(Debug, Clone, Args)]
pub struct PromptArgs {
    /// Prompt text (requires --tokenizer)
    pub prompt: Option<String>,

    /// HuggingFace tokenizer.json
    #[arg(short, long)]
    pub tokenizer: Option<PathBuf>,

    /// Comma-separated token ids, used instead of text
    #[arg(long, conflicts_with = "prompt")]
    pub ids: Option<String>,
}

impl PromptArgs {
    /// Token ids to feed, plus the tokenizer if one was given.
    pub fn resolve(&self) -> Result<(Vec<u32>, Option<Tokenizer>)> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .map(Tokenizer::from_file)
            .transpose()?;

        let ids = match (&self.ids, &self.prompt, &tokenizer) {
            (Some(ids), _, _) => parse_ids(ids)?,
            (None, Some(text), Some(tokenizer)) => tokenizer.encode(text, true, false)?.ids,
            (None, Some(_), None) => bail!("a text prompt needs --tokenizer"),
            (None, None, _) => bail!("give a prompt or --ids"),
        };
        if ids.is_empty() {
            bail!("prompt is empty");
        }
        Ok((ids, tokenizer))
    }
}

/// Parse `"1, 2,3"` into token ids.
pub fn parse_ids(s: &str) -> Result<Vec<u32>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("invalid token id: {part:?}"))
        })
        .collect()
}
