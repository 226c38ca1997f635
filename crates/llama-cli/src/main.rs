//! LLaMA decoder command-line interface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use llama_model::{GenerationConfig, SamplingConfig};
use std::path::PathBuf;
use tracing::info;

mod commands;

use commands::{ModelArgs, PromptArgs};

/// LLaMA decoder CLI
#[derive(Debug, Parser)]
#[command(name = "llama")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or text)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Continue a prompt, optionally conditioned on an audio embedding
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        prompt: PromptArgs,

        /// Safetensors file with an `encoder_out` audio embedding
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Comma-separated ids placed before the audio embedding
        #[arg(long)]
        left_prompt: Option<String>,

        /// Maximum number of generated tokens
        #[arg(short = 'n', long, default_value = "64")]
        max_new_tokens: usize,

        /// Stop token (defaults to the tokenizer's EOS)
        #[arg(long)]
        eos_id: Option<u32>,

        /// Always pick the most likely token
        #[arg(long)]
        greedy: bool,

        /// Sampling temperature
        #[arg(long, default_value = "1.0")]
        temperature: f32,

        /// Top-k filtering (0 = disabled)
        #[arg(long, default_value = "0")]
        top_k: usize,

        /// Nucleus filtering (1.0 = disabled)
        #[arg(long, default_value = "1.0")]
        top_p: f32,

        /// Penalty for already generated tokens (1.0 = disabled)
        #[arg(long, default_value = "1.0")]
        repetition_penalty: f32,
    },

    /// Report per-token negative log-likelihood and perplexity
    Score {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        prompt: PromptArgs,
    },

    /// Check a checkpoint against a configuration
    Inspect {
        /// Architecture configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Safetensors checkpoint
        #[arg(short, long)]
        weights: PathBuf,
    },

    /// Show version and build info
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = match cli.log_format {
        LogFormatArg::Json => runtime::logging::LogFormat::Json,
        LogFormatArg::Text => runtime::logging::LogFormat::Text,
    };
    runtime::logging::init_logging(&cli.log_level, format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LLaMA CLI");

    match cli.command {
        Commands::Generate {
            model,
            prompt,
            audio,
            left_prompt,
            max_new_tokens,
            eos_id,
            greedy,
            temperature,
            top_k,
            top_p,
            repetition_penalty,
        } => {
            let sampling = SamplingConfig {
                temperature: if greedy { 0.0 } else { temperature },
                top_k,
                top_p,
                repetition_penalty,
                seed: model.seed,
            };
            sampling.validate().context("invalid sampling options")?;

            let options = commands::generate::GenerateOptions {
                model,
                prompt,
                audio,
                left_prompt,
                generation: GenerationConfig {
                    max_new_tokens,
                    eos_token_id: eos_id,
                    sampling,
                },
            };
            commands::generate::run(options).context("generation failed")?;
        }
        Commands::Score { model, prompt } => {
            commands::score::run(&model, &prompt).context("scoring failed")?;
        }
        Commands::Inspect { config, weights } => {
            commands::inspect::run(&config, &weights).context("inspection failed")?;
        }
        Commands::Info => {
            commands::info::run();
        }
    }

    Ok(())
}
