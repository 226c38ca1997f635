//! Generation command implementation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use candle_core::{Device, Tensor};
use llama_core::TextTokenizer;
use llama_model::{GenerationConfig, Generator};
use tracing::{info, warn};

use super::{ModelArgs, PromptArgs, parse_ids};

/// Tensor name holding the audio embedding in `--audio` files.
pub const AUDIO_KEY: &str = "encoder_out";

/// Options for the generate command.
#[derive(Debug)]
pub struct GenerateOptions {
    pub model: ModelArgs,
    pub prompt: PromptArgs,
    pub audio: Option<PathBuf>,
    pub left_prompt: Option<String>,
    pub generation: GenerationConfig,
}

/// Run the generate command.
pub fn run(options: GenerateOptions) -> Result<()> {
    let start = Instant::now();
    let device = options.model.device()?;
    let model = options.model.load(&device)?;
    let (prompt, tokenizer) = options.prompt.resolve()?;

    let mut generation = options.generation;
    if generation.eos_token_id.is_none() {
        generation.eos_token_id = tokenizer.as_ref().and_then(|t| t.eos_token_id());
    }

    let mut generator = Generator::new(&model, generation);
    match (&options.audio, &options.left_prompt) {
        (Some(path), left_prompt) => {
            let audio = load_audio(path, &device)?;
            let left_prompt = left_prompt.as_deref().map(parse_ids).transpose()?;
            generator = generator.with_audio(audio, left_prompt.as_deref())?;
        }
        (None, Some(_)) => warn!("--left-prompt has no effect without --audio"),
        (None, None) => {}
    }

    let load_ms = start.elapsed().as_millis();
    let decode_start = Instant::now();
    let ids = generator.generate(&prompt)?;
    let decode_secs = decode_start.elapsed().as_secs_f32();

    info!(
        prompt_tokens = prompt.len(),
        generated = ids.len(),
        cached = generator.cache().len(),
        load_ms,
        "Generation finished"
    );

    if let Some(tokenizer) = &tokenizer {
        println!("{}", tokenizer.decode(&ids)?);
    }
    let joined: Vec<String> = ids.iter().map(u32::to_string).collect();
    println!("ids: {}", joined.join(","));
    if decode_secs > 0.0 {
        println!(
            "{} tokens in {:.2}s ({:.1} tok/s)",
            ids.len(),
            decode_secs,
            ids.len() as f32 / decode_secs
        );
    }
    Ok(())
}

/// Read an audio embedding of shape `(audio_len, dim)` or `(1, audio_len, dim)`.
pub fn load_audio(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading {}", path.display()))?;
    let audio = tensors
        .remove(AUDIO_KEY)
        .with_context(|| format!("{} has no '{AUDIO_KEY}' tensor", path.display()))?;
    match audio.rank() {
        2 => Ok(audio.unsqueeze(0)?),
        3 => Ok(audio),
        rank => bail!("audio embedding must have rank 2 or 3, got {rank}"),
    }
}
