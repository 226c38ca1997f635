//! Common data types shared across crates.

use serde::{Deserialize, Serialize};

/// A sequence of token ids produced by a tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSeq {
    /// Token IDs.
    pub ids: Vec<u32>,
}

impl TokenSeq {
    /// Create a new token sequence.
    pub fn new(ids: Vec<u32>) -> Self {
        Self { ids }
    }

    /// Create an empty token sequence.
    pub fn empty() -> Self {
        Self { ids: Vec::new() }
    }

    /// Get the number of tokens.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Prepend a beginning-of-sequence id.
    pub fn with_bos(mut self, bos: u32) -> Self {
        self.ids.insert(0, bos);
        self
    }

    /// Append an end-of-sequence id.
    pub fn with_eos(mut self, eos: u32) -> Self {
        self.ids.push(eos);
        self
    }
}

impl From<Vec<u32>> for TokenSeq {
    fn from(ids: Vec<u32>) -> Self {
        Self::new(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_seq() {
        let seq = TokenSeq::new(vec![5, 6, 7]);
        assert_eq!(seq.len(), 3);
        assert!(!seq.is_empty());

        let empty = TokenSeq::empty();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_special_tokens() {
        let seq = TokenSeq::from(vec![5, 6]).with_bos(1).with_eos(2);
        assert_eq!(seq.ids, vec![1, 5, 6, 2]);
    }
}
