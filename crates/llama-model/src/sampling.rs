//! Next-token selection from logits.
//!
//! Decoding policy lives outside the decoder: [`crate::Llama`] only returns
//! logits and a [`Sampler`] turns them into token ids.

use candle_core::{DType, Tensor};
use llama_core::{LlamaError, LlamaResult};
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Sampling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Logit temperature; `0.0` selects greedy decoding.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens (0 = disabled).
    pub top_k: usize,
    /// Keep the smallest set whose probability mass reaches `top_p` (1.0 = disabled).
    pub top_p: f32,
    /// Penalty for tokens already in the history (1.0 = disabled).
    pub repetition_penalty: f32,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Argmax decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            seed: Some(0),
            ..Default::default()
        }
    }

    /// Top-k sampling at temperature 1.
    pub fn top_k(k: usize) -> Self {
        Self {
            top_k: k,
            ..Default::default()
        }
    }

    /// Nucleus sampling at temperature 1.
    pub fn top_p(p: f32) -> Self {
        Self {
            top_p: p,
            ..Default::default()
        }
    }

    /// Whether sampling reduces to argmax.
    pub fn is_greedy(&self) -> bool {
        self.temperature < f32::EPSILON || self.top_k == 1
    }

    /// Reject out-of-range settings.
    pub fn validate(&self) -> LlamaResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(LlamaError::config(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(LlamaError::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.repetition_penalty.is_nan() || self.repetition_penalty <= 0.0 {
            return Err(LlamaError::config(format!(
                "repetition_penalty must be > 0, got {}",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Divide positive and multiply negative logits of every token in `history`
/// by `penalty`, so repeated tokens always become less likely.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if (penalty - 1.0).abs() < f32::EPSILON {
        return;
    }
    for &token in history {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit < 0.0 {
                *logit *= penalty;
            } else {
                *logit /= penalty;
            }
        }
    }
}

/// Index of the largest value (first one on ties).
pub fn argmax(values: &[f32]) -> u32 {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best as u32
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exp.into_iter().map(|x| x / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Candidates `(token, probability)` sorted by descending probability.
fn ranked(probs: &[f32]) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Keep the smallest prefix of `ranked` whose mass reaches `top_p`.
fn nucleus(ranked: &mut Vec<(u32, f32)>, top_p: f32) {
    let mut mass = 0.0;
    let mut keep = ranked.len();
    for (i, (_, p)) in ranked.iter().enumerate() {
        mass += p;
        if mass >= top_p {
            keep = i + 1;
            break;
        }
    }
    ranked.truncate(keep.max(1));
}

/// Token sampler with its own RNG.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler.
    pub fn new(config: SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    /// The configuration in use.
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick the next token from raw logits, penalizing ids in `history`.
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> u32 {
        if logits.is_empty() {
            return 0;
        }
        let mut logits = logits.to_vec();
        apply_repetition_penalty(&mut logits, history, self.config.repetition_penalty);

        if self.config.is_greedy() {
            return argmax(&logits);
        }

        let scaled: Vec<f32> = logits.iter().map(|x| x / self.config.temperature).collect();
        let mut candidates = ranked(&softmax(&scaled));
        if self.config.top_k > 0 {
            candidates.truncate(self.config.top_k);
        }
        if self.config.top_p < 1.0 {
            nucleus(&mut candidates, self.config.top_p);
        }

        match WeightedIndex::new(candidates.iter().map(|(_, p)| *p)) {
            Ok(dist) => candidates[dist.sample(&mut self.rng)].0,
            Err(_) => candidates[0].0,
        }
    }

    /// Pick the next token from a `(vocab_size,)` or `(1, vocab_size)` logits tensor.
    pub fn sample_tensor(&mut self, logits: &Tensor, history: &[u32]) -> LlamaResult<u32> {
        let logits = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok(self.sample(&logits, history))
    }
}
