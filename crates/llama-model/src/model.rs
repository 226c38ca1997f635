//! The decoder stack and its incremental generation entry point.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, embedding, linear_no_bias};
use llama_core::{LlamaError, LlamaResult};
use tracing::{debug, info, instrument};

use crate::attention::causal_mask;
use crate::cache::{DecodePhase, IncrementalCache, LayerKvCache};
use crate::config::ModelConfig;
use crate::layers::{RmsNorm, RotarySlice, RotaryTable, TransformerBlock};
use crate::prefix::{Prefix, assemble};
use crate::weights::{self, WeightMap};

/// Result of one [`Llama::generate_step`] call.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Logits of the last processed position, `(batch, vocab_size)`.
    pub logits: Tensor,
    /// Absolute position of the first processed position.
    pub position: usize,
    /// Number of positions processed (prefix included when priming).
    pub chunk_len: usize,
}

impl StepOutput {
    /// Absolute position of the next token to be fed.
    pub fn next_position(&self) -> usize {
        self.position + self.chunk_len
    }
}

/// Decoder-only LLaMA language model.
#[derive(Debug)]
pub struct Llama {
    tok_embeddings: Embedding,
    layers: Vec<TransformerBlock>,
    norm: RmsNorm,
    /// Untied projection to the vocabulary.
    output: Linear,
    rotary: RotaryTable,
    config: ModelConfig,
    device: Device,
}

impl Llama {
    /// Build the model from a variable builder.
    ///
    /// With a `VarMap`-backed builder every parameter is freshly initialized:
    /// norms to ones, adapter `A` uniform, adapter `B` zeros.
    pub fn new(config: ModelConfig, vb: VarBuilder) -> LlamaResult<Self> {
        config.validate()?;
        let device = vb.device().clone();

        let tok_embeddings = embedding(config.vocab_size, config.dim, vb.pp("tok_embeddings"))?;

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            debug!("Building layer {}/{}", i + 1, config.n_layers);
            layers.push(TransformerBlock::new(i, &config, vb.pp(format!("layers.{i}")))?);
        }

        let norm = RmsNorm::new(config.dim, config.norm_eps, vb.pp("norm"))?;
        let output = linear_no_bias(config.dim, config.vocab_size, vb.pp("output"))?;
        let rotary = RotaryTable::new(
            config.head_dim(),
            config.position_capacity(),
            config.rope_theta,
            &device,
        )?;

        info!(
            layers = config.n_layers,
            dim = config.dim,
            vocab = config.vocab_size,
            adapters = config.adapter.enabled,
            "Model built"
        );

        Ok(Self {
            tok_embeddings,
            layers,
            norm,
            output,
            rotary,
            config,
            device,
        })
    }

    /// Build the model from a flat parameter map.
    ///
    /// Base parameters must all be present with exact shapes. Absent
    /// adapter factors are created so that the adapters start as a no-op.
    pub fn from_weight_map(
        config: ModelConfig,
        mut weights: WeightMap,
        device: &Device,
    ) -> LlamaResult<Self> {
        config.validate()?;
        weights::validate(&config, &weights)?;

        let dtype: DType = config.dtype.into();
        if config.adapter.enabled {
            weights::fill_missing_adapters(&config, &mut weights, device, dtype)?;
        }

        let vb = VarBuilder::from_tensors(weights, dtype, device);
        Self::new(config, vb)
    }

    /// Load model weights from a safetensors checkpoint.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>, config: ModelConfig, device: &Device) -> LlamaResult<Self> {
        let path = path.as_ref();
        info!("Loading model from {}", path.display());
        let weights = weights::load_safetensors(path, device)?;
        debug!(tensors = weights.len(), "checkpoint read");
        Self::from_weight_map(config, weights, device)
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Device the weights live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of transformer layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// A fresh cache for one generation session.
    pub fn new_cache(&self) -> IncrementalCache {
        IncrementalCache::new(self.layers.len(), self.config.position_capacity())
    }

    /// Embed `(batch, seq)` token ids, rejecting ids outside the vocabulary.
    pub fn embed(&self, tokens: &Tensor) -> LlamaResult<Tensor> {
        let vocab_size = self.config.vocab_size;
        let ids = tokens.flatten_all()?.to_vec1::<u32>()?;
        if let Some(&id) = ids.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(LlamaError::InvalidTokenId { id, vocab_size });
        }
        Ok(self.tok_embeddings.forward(tokens)?)
    }

    /// Full-sequence forward in eval mode; logits for every position.
    pub fn forward(&self, tokens: &Tensor) -> LlamaResult<Tensor> {
        self.forward_t(tokens, &Prefix::none(), false)
    }

    /// Full-sequence forward without a cache.
    ///
    /// The prefix is assembled exactly as in priming, and the returned
    /// logits `(batch, text_len, vocab_size)` cover the text positions only.
    /// `train` enables adapter dropout.
    #[instrument(skip_all, fields(train = train))]
    pub fn forward_t(&self, tokens: &Tensor, prefix: &Prefix<'_>, train: bool) -> LlamaResult<Tensor> {
        let text_len = tokens.dim(1)?;
        let text = self.embed(tokens)?;
        let assembled = assemble(&text, prefix, |ids| self.embed(ids))?;

        let seq_len = assembled.hidden.dim(1)?;
        let rope = self.rotary.slice(0, seq_len)?;
        let mask = causal_mask(seq_len, seq_len, &self.device)?;

        let h = self.run_layers(assembled.hidden, &rope, Some(&mask), None, train)?;
        let h = h.narrow(1, assembled.prefix_len, text_len)?;
        let h = self.norm.forward(&h)?;
        Ok(self.output.forward(&h)?)
    }

    /// Advance a generation session by one step.
    ///
    /// `tokens` is `(batch, window)` and `start_pos` counts text tokens only.
    ///
    /// * `start_pos == 0` primes an empty cache: the text is embedded,
    ///   `prefix` is assembled ahead of it, and the whole sequence is cached.
    /// * `start_pos > 0` streams one token. `tokens` must be either that
    ///   newest token alone or the full text history (`start_pos + 1` ids),
    ///   of which only the last id is consumed. The position is shifted by
    ///   the prefix length recorded at priming, so `prefix` need not be
    ///   passed again; if it is, it must have the same length.
    ///
    /// Only the logits of the last processed position are returned.
    #[instrument(skip(self, tokens, prefix, cache), fields(dims = ?tokens.dims()))]
    pub fn generate_step(
        &self,
        tokens: &Tensor,
        start_pos: usize,
        prefix: &Prefix<'_>,
        cache: &mut IncrementalCache,
    ) -> LlamaResult<StepOutput> {
        if cache.num_layers() != self.layers.len() {
            return Err(LlamaError::cache_state(format!(
                "cache covers {} layers, model has {}",
                cache.num_layers(),
                self.layers.len()
            )));
        }
        let (_, window) = tokens.dims2()?;
        if window == 0 {
            return Err(LlamaError::shape_mismatch("empty token window"));
        }

        let (hidden, position, primed_prefix) = if start_pos == 0 {
            if cache.phase() != DecodePhase::Uninitialized || !cache.is_empty() {
                return Err(LlamaError::cache_state(
                    "priming requires an empty cache; reset it before starting a new sequence",
                ));
            }
            let text = self.embed(tokens)?;
            let assembled = assemble(&text, prefix, |ids| self.embed(ids))?;
            (assembled.hidden, 0, Some(assembled.prefix_len))
        } else {
            if cache.phase() == DecodePhase::Uninitialized {
                return Err(LlamaError::cache_state(
                    "streaming step at start_pos > 0 before the cache was primed",
                ));
            }
            if window != 1 && window != start_pos + 1 {
                return Err(LlamaError::cache_state(format!(
                    "streaming window must be the newest token or the full history of {} ids, got {window}",
                    start_pos + 1
                )));
            }
            if !prefix.is_empty() && prefix.len()? != cache.prefix_len() {
                return Err(LlamaError::cache_state(format!(
                    "prefix of length {} differs from the {} positions primed",
                    prefix.len()?,
                    cache.prefix_len()
                )));
            }
            let position = start_pos + cache.prefix_len();
            if position != cache.len() {
                return Err(LlamaError::cache_state(format!(
                    "position {position} does not follow the {} cached positions",
                    cache.len()
                )));
            }
            let newest = tokens.narrow(1, window - 1, 1)?;
            (self.embed(&newest)?, position, None)
        };

        let chunk_len = hidden.dim(1)?;
        debug!(position, chunk_len, priming = primed_prefix.is_some(), "decode step");

        // fails before any layer touches the cache
        let rope = self.rotary.slice(position, chunk_len)?;
        let mask = if chunk_len > 1 {
            Some(causal_mask(chunk_len, position + chunk_len, &self.device)?)
        } else {
            None
        };

        let result = self.run_layers(hidden, &rope, mask.as_ref(), Some(cache.layers_mut()), false);
        let h = match result {
            Ok(h) => h,
            Err(e) => {
                if primed_prefix.is_some() {
                    cache.reset();
                }
                return Err(e);
            }
        };
        match primed_prefix {
            Some(prefix_len) => cache.mark_primed(prefix_len),
            None => cache.mark_streaming(),
        }

        let last = h.narrow(1, chunk_len - 1, 1)?.squeeze(1)?;
        let logits = self.output.forward(&self.norm.forward(&last)?)?;

        Ok(StepOutput {
            logits,
            position,
            chunk_len,
        })
    }

    /// Reorder the batch rows of every cached tensor (beam search).
    pub fn reorder_cache(&self, cache: &mut IncrementalCache, new_order: &[u32]) -> LlamaResult<()> {
        cache.reorder(new_order)
    }

    fn run_layers(
        &self,
        mut h: Tensor,
        rope: &RotarySlice,
        mask: Option<&Tensor>,
        mut cache: Option<&mut [LayerKvCache]>,
        train: bool,
    ) -> LlamaResult<Tensor> {
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().and_then(|c| c.get_mut(i));
            h = layer.forward(&h, rope, mask, layer_cache, train)?;
        }
        Ok(h)
    }
}
