//! # llama-model
//!
//! Decoder-only LLaMA transformer with optional multimodal priming.
//!
//! This crate provides:
//! - Rotary position embeddings over interleaved feature pairs
//! - RMSNorm pre-normalization and SwiGLU feed-forward blocks
//! - Multi-head causal attention with low-rank adapters (LoRA) on all four
//!   projections and two interchangeable score backends
//! - A per-session incremental KV cache with beam reordering
//! - Priming with `[left prompt | audio | text]` and single-token streaming
//! - Sampling strategies and a generation loop
//!
//! # Architecture
//!
//! - Token embedding table
//! - N transformer blocks, each:
//!   - `h = x + attention(norm(x))`
//!   - `out = h + feed_forward(norm(h))`
//! - Final RMSNorm
//! - Untied output projection to the vocabulary
//!
//! # Example
//!
//! ```ignore
//! use llama_model::{Llama, ModelConfig, Prefix};
//! use candle_core::{Device, Tensor};
//!
//! let device = Device::Cpu;
//! let model = Llama::load("model.safetensors", ModelConfig::default(), &device)?;
//! let mut cache = model.new_cache();
//!
//! let prompt = Tensor::new(&[1u32, 306, 4966], &device)?.unsqueeze(0)?;
//! let step = model.generate_step(&prompt, 0, &Prefix::none(), &mut cache)?;
//! ```

pub mod attention;
pub mod cache;
pub mod config;
pub mod generation;
pub mod layers;
pub mod lora;
pub mod model;
pub mod prefix;
pub mod sampling;
pub mod weights;

pub use attention::{Attention, blockwise_attention, causal_mask, explicit_attention};
pub use cache::{DecodePhase, IncrementalCache, LayerKvCache};
pub use config::{AdapterConfig, AttentionBackend, ModelConfig, ModelDType};
pub use generation::{GenerationConfig, Generator};
pub use layers::{FeedForward, RmsNorm, RotarySlice, RotaryTable, TransformerBlock};
pub use lora::{LoraAdapter, Projection};
pub use model::{Llama, StepOutput};
pub use prefix::{AssembledPrefix, Prefix, assemble};
pub use sampling::{Sampler, SamplingConfig};
pub use weights::{WeightMap, random_init};
