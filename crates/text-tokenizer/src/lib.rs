//! # text-tokenizer
//!
//! Text tokenization for the LLaMA decoder.
//!
//! Wraps a `tokenizer.json` vocabulary and adds the LLaMA framing rules:
//! BOS and EOS are added explicitly per call rather than by the vocabulary's
//! post-processor, and special ids are resolved from the `<s>`, `</s>` and
//! `<pad>` pieces.
//!
//! # Example
//!
//! ```ignore
//! use text_tokenizer::Tokenizer;
//! use llama_core::TextTokenizer;
//!
//! let tokenizer = Tokenizer::from_file("tokenizer.json")?;
//! let tokens = tokenizer.encode("Hello world", true, false)?;
//! println!("Token IDs: {:?}", tokens.ids);
//! ```

use std::path::Path;

use llama_core::{LlamaError, LlamaResult, TextTokenizer, TokenSeq};
use tracing::instrument;

/// `tokenizers`-backed LLaMA tokenizer.
#[derive(Debug)]
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
}

impl Tokenizer {
    /// Load a tokenizer from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> LlamaResult<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| LlamaError::ModelLoad {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;
        Ok(Self::wrap(inner))
    }

    /// Create a tokenizer from a JSON string.
    pub fn from_json(json: &str) -> LlamaResult<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(json.as_bytes())
            .map_err(|e| LlamaError::config(format!("invalid tokenizer JSON: {e}")))?;
        Ok(Self::wrap(inner))
    }

    fn wrap(inner: tokenizers::Tokenizer) -> Self {
        let bos_token_id = inner.token_to_id("<s>").or_else(|| inner.token_to_id("<bos>"));
        let eos_token_id = inner.token_to_id("</s>").or_else(|| inner.token_to_id("<eos>"));
        // vocabularies without a pad piece pad with <unk>
        let pad_token_id = inner.token_to_id("<pad>").or_else(|| inner.token_to_id("<unk>"));
        Self {
            inner,
            bos_token_id,
            eos_token_id,
            pad_token_id,
        }
    }

    /// Get the underlying tokenizers::Tokenizer.
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }

    fn is_framing(&self, id: u32) -> bool {
        Some(id) == self.bos_token_id || Some(id) == self.eos_token_id || Some(id) == self.pad_token_id
    }
}

impl TextTokenizer for Tokenizer {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    fn encode(&self, text: &str, bos: bool, eos: bool) -> LlamaResult<TokenSeq> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| LlamaError::tokenization(e.to_string()))?;
        frame(
            TokenSeq::new(encoding.get_ids().to_vec()),
            bos.then_some(self.bos_token_id),
            eos.then_some(self.eos_token_id),
        )
    }

    #[instrument(skip(self, ids), fields(num_tokens = ids.len()))]
    fn decode(&self, ids: &[u32]) -> LlamaResult<String> {
        let content: Vec<u32> = ids.iter().copied().filter(|&id| !self.is_framing(id)).collect();
        self.inner
            .decode(&content, true)
            .map_err(|e| LlamaError::tokenization(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}

/// Add BOS/EOS when requested; a requested but unknown id is an error.
fn frame(seq: TokenSeq, bos: Option<Option<u32>>, eos: Option<Option<u32>>) -> LlamaResult<TokenSeq> {
    let seq = match bos {
        Some(Some(id)) => seq.with_bos(id),
        Some(None) => return Err(LlamaError::tokenization("vocabulary has no BOS token")),
        None => seq,
    };
    match eos {
        Some(Some(id)) => Ok(seq.with_eos(id)),
        Some(None) => Err(LlamaError::tokenization("vocabulary has no EOS token")),
        None => Ok(seq),
    }
}

/// Deterministic byte-level tokenizer for tests without model files.
///
/// Ids 0..3 are `<unk>`, `<s>`, `</s>` and `<pad>`; byte `b` maps to `b + 3`
/// modulo the vocabulary.
#[derive(Debug)]
pub struct MockTokenizer {
    vocab_size: usize,
}

impl MockTokenizer {
    /// First id used for content bytes.
    pub const BYTE_OFFSET: u32 = 3;

    /// Create a new mock tokenizer. `vocab_size` must exceed the special ids.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size: vocab_size.max(Self::BYTE_OFFSET as usize + 1),
        }
    }
}

impl Default for MockTokenizer {
    fn default() -> Self {
        Self::new(256 + Self::BYTE_OFFSET as usize)
    }
}

impl TextTokenizer for MockTokenizer {
    fn encode(&self, text: &str, bos: bool, eos: bool) -> LlamaResult<TokenSeq> {
        let span = self.vocab_size as u32 - Self::BYTE_OFFSET;
        let ids: Vec<u32> = text
            .bytes()
            .map(|b| Self::BYTE_OFFSET + (b as u32) % span)
            .collect();
        frame(
            TokenSeq::new(ids),
            bos.then_some(self.bos_token_id()),
            eos.then_some(self.eos_token_id()),
        )
    }

    fn decode(&self, ids: &[u32]) -> LlamaResult<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= Self::BYTE_OFFSET)
            .map(|&id| (id - Self::BYTE_OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(1)
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(2)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(0)
    }
}
