//! Model configuration.

use std::path::Path;

use llama_core::{LlamaError, LlamaResult};
use serde::{Deserialize, Serialize};

/// Architecture and adapter configuration for the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Number of attention heads.
    pub n_heads: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Rounding factor for the feed-forward hidden width.
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    /// RMS norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Maximum text sequence length. The rotary table covers twice this.
    pub max_seq_len: usize,
    /// Base of the rotary frequencies.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Low-rank adapters on the attention projections.
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Score computation strategy.
    #[serde(default)]
    pub attention_backend: AttentionBackend,
    /// Parameter dtype.
    #[serde(default)]
    pub dtype: ModelDType,
}

fn default_multiple_of() -> usize {
    256
}

fn default_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

/// Low-rank adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Attach adapters to the four attention projections.
    pub enabled: bool,
    /// Rank of the A/B factors.
    pub rank: usize,
    /// Gain numerator; the applied gain is `alpha / rank`.
    pub alpha: f64,
    /// Dropout on the adapter input branch.
    pub dropout: f32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rank: 8,
            alpha: 32.0,
            dropout: 0.1,
        }
    }
}

impl AdapterConfig {
    /// Adapters switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Scalar gain applied to the low-rank product.
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// How attention scores are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttentionBackend {
    /// Full score matrix followed by a masked softmax.
    #[default]
    Explicit,
    /// Key-blocked online softmax; never materializes the full score matrix.
    MemoryEfficient {
        /// Number of key positions processed per block.
        block_size: usize,
    },
}

/// Parameter dtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    /// 32-bit floating point.
    #[default]
    F32,
    /// 16-bit floating point.
    F16,
    /// Brain floating point 16.
    Bf16,
}

impl From<ModelDType> for candle_core::DType {
    fn from(dtype: ModelDType) -> Self {
        match dtype {
            ModelDType::F32 => candle_core::DType::F32,
            ModelDType::F16 => candle_core::DType::F16,
            ModelDType::Bf16 => candle_core::DType::BF16,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            vocab_size: 32000,
            multiple_of: default_multiple_of(),
            norm_eps: default_norm_eps(),
            max_seq_len: 1024,
            rope_theta: default_rope_theta(),
            adapter: AdapterConfig::default(),
            attention_backend: AttentionBackend::Explicit,
            dtype: ModelDType::F32,
        }
    }
}

impl ModelConfig {
    /// A small configuration for tests and benchmarks.
    pub fn tiny() -> Self {
        Self {
            dim: 64,
            n_layers: 2,
            n_heads: 4,
            vocab_size: 128,
            multiple_of: 32,
            norm_eps: 1e-6,
            max_seq_len: 128,
            rope_theta: default_rope_theta(),
            adapter: AdapterConfig::disabled(),
            attention_backend: AttentionBackend::Explicit,
            dtype: ModelDType::F32,
        }
    }

    /// Read a configuration from a JSON file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> LlamaResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the layers rely on.
    pub fn validate(&self) -> LlamaResult<()> {
        if self.dim == 0 || self.n_heads == 0 || self.n_layers == 0 {
            return Err(LlamaError::config(
                "dim, n_heads and n_layers must be non-zero",
            ));
        }
        if self.dim % self.n_heads != 0 {
            return Err(LlamaError::shape_mismatch(format!(
                "dim {} is not divisible by {} heads",
                self.dim, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(LlamaError::shape_mismatch(format!(
                "head dimension {} must be even for rotary pairs",
                self.head_dim()
            )));
        }
        if self.vocab_size == 0 || self.max_seq_len == 0 || self.multiple_of == 0 {
            return Err(LlamaError::config(
                "vocab_size, max_seq_len and multiple_of must be non-zero",
            ));
        }
        if self.adapter.enabled {
            if self.adapter.rank == 0 {
                return Err(LlamaError::config("adapter rank must be non-zero"));
            }
            if !(0.0..1.0).contains(&self.adapter.dropout) {
                return Err(LlamaError::config(format!(
                    "adapter dropout {} outside [0, 1)",
                    self.adapter.dropout
                )));
            }
        }
        if let AttentionBackend::MemoryEfficient { block_size: 0 } = self.attention_backend {
            return Err(LlamaError::config("attention block size must be non-zero"));
        }
        Ok(())
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Feed-forward hidden width: two thirds of `4 * dim`, rounded up to `multiple_of`.
    pub fn ffn_hidden_dim(&self) -> usize {
        let hidden = 2 * (4 * self.dim) / 3;
        self.multiple_of * hidden.div_ceil(self.multiple_of)
    }

    /// Number of absolute positions the rotary table and caches can address.
    pub fn position_capacity(&self) -> usize {
        2 * self.max_seq_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        assert_eq!(config.dim, 4096);
        assert_eq!(config.n_layers, 32);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.ffn_hidden_dim(), 11008);
        assert!(config.adapter.enabled);
        assert_eq!(config.adapter.scaling(), 4.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let config = ModelConfig {
            dim: 10,
            n_heads: 3,
            ..ModelConfig::tiny()
        };
        assert!(matches!(
            config.validate(),
            Err(LlamaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_odd_head_dim_rejected() {
        let config = ModelConfig {
            dim: 12,
            n_heads: 4,
            ..ModelConfig::tiny()
        };
        assert!(matches!(
            config.validate(),
            Err(LlamaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_ffn_hidden_rounding() {
        let config = ModelConfig {
            dim: 8,
            multiple_of: 8,
            ..ModelConfig::tiny()
        };
        // 2 * 32 / 3 = 21, rounded up to 24
        assert_eq!(config.ffn_hidden_dim(), 24);
    }

    #[test]
    fn test_backend_serde() {
        let config = ModelConfig {
            attention_backend: AttentionBackend::MemoryEfficient { block_size: 16 },
            ..ModelConfig::tiny()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("memory_efficient"));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"dim": 8, "n_layers": 1, "n_heads": 2, "vocab_size": 10, "max_seq_len": 16}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.multiple_of, 256);
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.attention_backend, AttentionBackend::Explicit);
        config.validate().unwrap();
    }
}
