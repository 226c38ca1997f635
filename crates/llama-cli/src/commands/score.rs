//! Scoring command implementation.

use anyhow::Result;
use llama_core::TextTokenizer;
use runtime::score_ids;
use tracing::info;

use super::{ModelArgs, PromptArgs};

/// Run the score command: per-token negative log-likelihood and perplexity.
pub fn run(model: &ModelArgs, prompt: &PromptArgs) -> Result<()> {
    let device = model.device()?;
    let model = model.load(&device)?;
    let (ids, tokenizer) = prompt.resolve()?;

    let score = score_ids(&model, ids)?;
    info!(tokens = score.tokens.len(), "Scored");

    println!("{:>5}  {:>8}  {:>10}  piece", "pos", "token", "nll");
    for (pos, (&token, log_prob)) in score.tokens.iter().skip(1).zip(&score.log_probs).enumerate() {
        let piece = match &tokenizer {
            Some(tokenizer) => tokenizer.decode(&[token]).unwrap_or_default(),
            None => String::new(),
        };
        println!("{:>5}  {:>8}  {:>10.4}  {piece}", pos + 1, token, -log_prob);
    }
    println!();
    println!("total nll:  {:.4}", -score.total());
    println!("perplexity: {:.4}", score.perplexity());
    Ok(())
}
