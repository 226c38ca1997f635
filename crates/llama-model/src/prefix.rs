//! Multimodal prefix assembly for the priming step.
//!
//! On the first decode step the model sees one causal sequence built from
//! up to three segments, in this order:
//!
//! ```text
//! [ left prompt | audio | text ]
//! ```
//!
//! The left prompt only takes part when audio is present; text-only priming
//! is plain text embedding.

use candle_core::Tensor;
use llama_core::{LlamaError, LlamaResult};
use tracing::warn;

/// Optional non-text conditioning for a sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefix<'a> {
    /// Externally encoded audio, `(batch, audio_len, dim)`, already in the
    /// model's embedding space.
    pub audio: Option<&'a Tensor>,
    /// Prompt token ids, `(batch, prompt_len)`, placed before the audio.
    pub left_prompt: Option<&'a Tensor>,
}

impl<'a> Prefix<'a> {
    /// No conditioning: plain text decoding.
    pub fn none() -> Self {
        Self::default()
    }

    /// Audio conditioning only.
    pub fn audio(audio: &'a Tensor) -> Self {
        Self {
            audio: Some(audio),
            left_prompt: None,
        }
    }

    /// Audio conditioning preceded by a text prompt.
    pub fn with_left_prompt(audio: &'a Tensor, left_prompt: &'a Tensor) -> Self {
        Self {
            audio: Some(audio),
            left_prompt: Some(left_prompt),
        }
    }

    /// Number of positions the prefix occupies ahead of the text.
    pub fn len(&self) -> LlamaResult<usize> {
        let Some(audio) = self.audio else {
            return Ok(0);
        };
        let audio_len = audio.dim(1)?;
        let prompt_len = match self.left_prompt {
            Some(prompt) => prompt.dim(1)?,
            None => 0,
        };
        Ok(audio_len + prompt_len)
    }

    /// Whether the prefix contributes no positions.
    pub fn is_empty(&self) -> bool {
        self.audio.is_none()
    }
}

/// Output of [`assemble`].
#[derive(Debug, Clone)]
pub struct AssembledPrefix {
    /// `(batch, prefix_len + text_len, dim)` embeddings.
    pub hidden: Tensor,
    /// Positions taken by the left prompt and audio.
    pub prefix_len: usize,
}

/// Concatenate `[left_prompt, audio, text]` embeddings along the sequence axis.
///
/// `text_emb` is the embedded text window and `embed_prompt` embeds the
/// left prompt ids. Audio must agree with the text on batch size and width.
pub fn assemble<F>(text_emb: &Tensor, prefix: &Prefix<'_>, embed_prompt: F) -> LlamaResult<AssembledPrefix>
where
    F: FnOnce(&Tensor) -> LlamaResult<Tensor>,
{
    let Some(audio) = prefix.audio else {
        if prefix.left_prompt.is_some() {
            warn!("left prompt supplied without audio; decoding text only");
        }
        return Ok(AssembledPrefix {
            hidden: text_emb.clone(),
            prefix_len: 0,
        });
    };

    let (batch, _, dim) = text_emb.dims3()?;
    let (audio_batch, audio_len, audio_dim) = audio.dims3()?;
    if audio_batch != batch || audio_dim != dim {
        return Err(LlamaError::shape_mismatch(format!(
            "audio embedding ({audio_batch}, {audio_len}, {audio_dim}) does not match text batch {batch} / dim {dim}"
        )));
    }
    let audio = audio.to_dtype(text_emb.dtype())?;

    let (hidden, prefix_len) = match prefix.left_prompt {
        Some(prompt_ids) => {
            let prompt_emb = embed_prompt(prompt_ids)?;
            let prompt_len = prompt_emb.dim(1)?;
            let hidden = Tensor::cat(&[&prompt_emb, &audio, text_emb], 1)?;
            (hidden, prompt_len + audio_len)
        }
        None => (Tensor::cat(&[&audio, text_emb], 1)?, audio_len),
    };

    Ok(AssembledPrefix { hidden, prefix_len })
}
