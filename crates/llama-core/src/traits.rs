//! Trait definitions for components the model core talks to.

use crate::error::LlamaResult;
use crate::types::TokenSeq;

/// Text tokenization trait.
///
/// Implementations convert text into token ids understood by the decoder and
/// back again. The decoder itself only ever sees ids.
pub trait TextTokenizer: Send + Sync {
    /// Encode text into tokens, optionally framing it with BOS/EOS.
    fn encode(&self, text: &str, bos: bool, eos: bool) -> LlamaResult<TokenSeq>;

    /// Decode token ids back to text.
    fn decode(&self, ids: &[u32]) -> LlamaResult<String>;

    /// Get the vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Get the BOS (beginning of sequence) token ID.
    fn bos_token_id(&self) -> Option<u32>;

    /// Get the EOS (end of sequence) token ID.
    fn eos_token_id(&self) -> Option<u32>;

    /// Get the PAD token ID.
    fn pad_token_id(&self) -> Option<u32>;
}
