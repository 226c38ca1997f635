//! Autoregressive generation loop on top of [`Llama::generate_step`].

use candle_core::Tensor;
use llama_core::{LlamaError, LlamaResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::cache::{DecodePhase, IncrementalCache};
use crate::model::Llama;
use crate::prefix::Prefix;
use crate::sampling::{Sampler, SamplingConfig};

/// Stopping and sampling policy of a generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
    /// Stop as soon as this id is sampled; it is not returned.
    pub eos_token_id: Option<u32>,
    /// Next-token selection.
    pub sampling: SamplingConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            eos_token_id: None,
            sampling: SamplingConfig::default(),
        }
    }
}

/// One single-sequence generation session.
///
/// Owns its cache, so sessions sharing a model never share cache storage.
#[derive(Debug)]
pub struct Generator<'m> {
    model: &'m Llama,
    cache: IncrementalCache,
    sampler: Sampler,
    config: GenerationConfig,
    /// Prompt plus generated text tokens.
    history: Vec<u32>,
    audio: Option<Tensor>,
    left_prompt: Option<Tensor>,
    generated: usize,
    finished: bool,
}

impl<'m> Generator<'m> {
    /// Text-only session.
    pub fn new(model: &'m Llama, config: GenerationConfig) -> Self {
        Self {
            model,
            cache: model.new_cache(),
            sampler: Sampler::new(config.sampling.clone()),
            config,
            history: Vec::new(),
            audio: None,
            left_prompt: None,
            generated: 0,
            finished: false,
        }
    }

    /// Condition the session on an audio embedding `(1, audio_len, dim)` and
    /// an optional left prompt placed before it.
    pub fn with_audio(
        mut self,
        audio: Tensor,
        left_prompt: Option<&[u32]>,
    ) -> LlamaResult<Self> {
        self.left_prompt = match left_prompt {
            Some(ids) => Some(Tensor::new(ids, self.model.device())?.unsqueeze(0)?),
            None => None,
        };
        self.audio = Some(audio);
        Ok(self)
    }

    /// Text tokens seen so far: prompt followed by generated ids.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    /// The session cache.
    pub fn cache(&self) -> &IncrementalCache {
        &self.cache
    }

    /// Number of tokens generated since priming.
    pub fn generated_count(&self) -> usize {
        self.generated
    }

    /// Whether EOS or the token budget stopped the session.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the prompt and return the first generated token.
    ///
    /// Returns `None` if that token is EOS or the budget is zero.
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub fn prime(&mut self, prompt: &[u32]) -> LlamaResult<Option<u32>> {
        if self.cache.phase() != DecodePhase::Uninitialized {
            return Err(LlamaError::cache_state("session already primed"));
        }
        if prompt.is_empty() {
            return Err(LlamaError::shape_mismatch("prompt must contain at least one token"));
        }
        let tokens = Tensor::new(prompt, self.model.device())?.unsqueeze(0)?;
        let prefix = Prefix {
            audio: self.audio.as_ref(),
            left_prompt: self.left_prompt.as_ref(),
        };
        let step = self.model.generate_step(&tokens, 0, &prefix, &mut self.cache)?;
        self.history.extend_from_slice(prompt);
        debug!(cached = self.cache.len(), "primed");
        self.accept(&step.logits)
    }

    /// Feed the newest history token and return the following one.
    pub fn next_token(&mut self) -> LlamaResult<Option<u32>> {
        if self.finished || self.generated >= self.config.max_new_tokens {
            self.finished = true;
            return Ok(None);
        }
        let Some(&newest) = self.history.last() else {
            return Err(LlamaError::cache_state("next_token called before prime"));
        };
        let start_pos = self.history.len() - 1;
        let tokens = Tensor::new(&[newest], self.model.device())?.unsqueeze(0)?;
        let step = self
            .model
            .generate_step(&tokens, start_pos, &Prefix::none(), &mut self.cache)?;
        self.accept(&step.logits)
    }

    /// Prime with `prompt` and run until EOS or `max_new_tokens`.
    ///
    /// Returns the generated ids only.
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len(), max_new_tokens = self.config.max_new_tokens))]
    pub fn generate(&mut self, prompt: &[u32]) -> LlamaResult<Vec<u32>> {
        let mut out = Vec::with_capacity(self.config.max_new_tokens);
        let mut next = self.prime(prompt)?;
        while let Some(token) = next {
            out.push(token);
            next = self.next_token()?;
        }
        info!(generated = out.len(), "generation finished");
        Ok(out)
    }

    fn accept(&mut self, logits: &Tensor) -> LlamaResult<Option<u32>> {
        if self.generated >= self.config.max_new_tokens {
            self.finished = true;
            return Ok(None);
        }
        let token = self.sampler.sample_tensor(logits, &self.history)?;
        if Some(token) == self.config.eos_token_id {
            debug!(step = self.generated, "EOS");
            self.finished = true;
            return Ok(None);
        }
        self.history.push(token);
        self.generated += 1;
        Ok(Some(token))
    }
}
