//! # llama-core
//!
//! Core types, traits, and error definitions for the multimodal LLaMA decoder.
//!
//! This crate provides the foundational abstractions used across all other
//! crates in the workspace:
//!
//! - Token sequences (`TokenSeq`)
//! - The tokenizer seam (`TextTokenizer`)
//! - Unified error handling via `LlamaError`
//! - Runtime configuration (logging, device)

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{DeviceConfig, DeviceType, LoggingConfig, RuntimeConfig};
pub use error::{LlamaError, LlamaResult};
pub use traits::TextTokenizer;
pub use types::TokenSeq;
