//! Text pipeline: tokenizer → decoder → sampler → detokenizer.

use std::path::Path;
use std::sync::Arc;

use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use llama_core::{LlamaError, LlamaResult, TextTokenizer};
use llama_model::{GenerationConfig, Generator, Llama, ModelConfig};
use text_tokenizer::{MockTokenizer, Tokenizer};
use tracing::{debug, info, instrument};

/// Per-token log-likelihood of a text under the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    /// Scored token ids (BOS included).
    pub tokens: Vec<u32>,
    /// `log p(tokens[i + 1] | tokens[..=i])` for every predicted position.
    pub log_probs: Vec<f32>,
}

impl Score {
    /// Sum of the per-token log-probabilities.
    pub fn total(&self) -> f32 {
        self.log_probs.iter().sum()
    }

    /// `exp(-mean log p)`; infinite when nothing was predicted.
    pub fn perplexity(&self) -> f32 {
        if self.log_probs.is_empty() {
            return f32::INFINITY;
        }
        (-self.total() / self.log_probs.len() as f32).exp()
    }
}

/// A decoder paired with a tokenizer.
pub struct TextPipeline {
    model: Arc<Llama>,
    tokenizer: Arc<dyn TextTokenizer>,
}

impl std::fmt::Debug for TextPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextPipeline")
            .field("model", &self.model.config())
            .field("vocab_size", &self.tokenizer.vocab_size())
            .finish()
    }
}

impl TextPipeline {
    /// Combine a model and a tokenizer whose vocabularies agree.
    pub fn new(model: Arc<Llama>, tokenizer: Arc<dyn TextTokenizer>) -> LlamaResult<Self> {
        let (model_vocab, tok_vocab) = (model.config().vocab_size, tokenizer.vocab_size());
        if tok_vocab > model_vocab {
            return Err(LlamaError::config(format!(
                "tokenizer vocabulary ({tok_vocab}) exceeds model vocabulary ({model_vocab})"
            )));
        }
        Ok(Self { model, tokenizer })
    }

    /// Randomly initialized tiny model with the byte-level mock tokenizer.
    pub fn new_mock() -> LlamaResult<Self> {
        let tokenizer = MockTokenizer::default();
        let config = ModelConfig {
            vocab_size: tokenizer.vocab_size(),
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Llama::new(config, vb)?;
        info!("Mock pipeline ready");
        Self::new(Arc::new(model), Arc::new(tokenizer))
    }

    /// Load checkpoint, architecture config and tokenizer from disk.
    #[instrument(skip_all, fields(weights = %weights.as_ref().display()))]
    pub fn from_files(
        weights: impl AsRef<Path>,
        config: impl AsRef<Path>,
        tokenizer: impl AsRef<Path>,
        device: &Device,
    ) -> LlamaResult<Self> {
        let config = ModelConfig::from_file(config)?;
        let tokenizer = Tokenizer::from_file(tokenizer)?;
        let model = Llama::load(weights, config, device)?;
        Self::new(Arc::new(model), Arc::new(tokenizer))
    }

    /// The decoder.
    pub fn model(&self) -> &Llama {
        &self.model
    }

    /// The tokenizer.
    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    /// Continue `prompt` and return the generated text.
    ///
    /// Generation stops at the tokenizer's EOS unless `config` names another.
    #[instrument(skip(self, config), fields(max_new_tokens = config.max_new_tokens))]
    pub fn generate(&self, prompt: &str, config: &GenerationConfig) -> LlamaResult<String> {
        let tokens = self.tokenizer.encode(prompt, true, false)?;
        let config = GenerationConfig {
            eos_token_id: config.eos_token_id.or(self.tokenizer.eos_token_id()),
            ..config.clone()
        };
        let mut generator = Generator::new(&self.model, config);
        let ids = generator.generate(&tokens.ids)?;
        debug!(prompt_tokens = tokens.len(), generated = ids.len(), "decoded");
        self.tokenizer.decode(&ids)
    }

    /// Log-likelihood of `text` under the model, via one full forward pass.
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    pub fn score(&self, text: &str) -> LlamaResult<Score> {
        let tokens = self.tokenizer.encode(text, true, false)?.ids;
        score_ids(&self.model, tokens)
    }
}

/// Score a token sequence with one full forward pass.
pub fn score_ids(model: &Llama, tokens: Vec<u32>) -> LlamaResult<Score> {
    if tokens.is_empty() {
        return Err(LlamaError::shape_mismatch("cannot score an empty sequence"));
    }
    let input = Tensor::new(tokens.as_slice(), model.device())?.unsqueeze(0)?;
    let logits = model.forward(&input)?.i(0)?.to_dtype(DType::F32)?;
    let rows = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

    let log_probs = tokens
        .iter()
        .skip(1)
        .zip(rows.iter())
        .map(|(&next, row)| row[next as usize])
        .collect();
    Ok(Score { tokens, log_probs })
}
