//! # runtime
//!
//! Process-level wiring around the LLaMA decoder.
//!
//! This crate provides:
//! - Structured logging setup
//! - Device selection (CPU/CUDA/Metal)
//! - Model warm-up
//! - A text pipeline pairing the decoder with a tokenizer

pub mod device;
pub mod logging;
pub mod pipeline;
pub mod warm;

pub use device::{device_name, select_device};
pub use pipeline::{Score, TextPipeline, score_ids};

use candle_core::Device;
use llama_core::{LlamaResult, RuntimeConfig};
use tracing::info;

/// Install logging and pick the compute device described by `config`.
pub fn bootstrap(config: &RuntimeConfig) -> LlamaResult<Device> {
    logging::init_logging_from_config(&config.logging)?;
    let device = select_device(&config.device)?;
    info!(device = device_name(&device), "Runtime initialized");
    Ok(device)
}
