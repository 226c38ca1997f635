use candle_core::Tensor;
use llama_core::{LlamaError, LlamaResult};
use llama_model::{Llama, Prefix};
use tracing::{info, warn};

/// Run a few throwaway decode sessions so backend kernels are compiled and
/// allocators are warm before the first real request.
///
/// Each run primes a fresh cache with `prompt` and streams `steps` tokens.
/// Failures are logged and skipped.
///
/// # Example
/// ```ignore
/// use runtime::warm::warm_model;
/// warm_model(&model, &[1, 2, 3], 8, 3)?;
/// ```
pub fn warm_model(model: &Llama, prompt: &[u32], steps: usize, runs: usize) -> LlamaResult<()> {
    if prompt.is_empty() {
        return Err(LlamaError::shape_mismatch("warm-up prompt must not be empty"));
    }
    info!(runs, steps, "Warming model");
    let tokens = Tensor::new(prompt, model.device())?.unsqueeze(0)?;

    for run in 1..=runs {
        if let Err(e) = warm_once(model, &tokens, prompt.len(), steps) {
            warn!("Warmup run {run}/{runs} failed: {e}");
        }
    }

    info!("Cold start pre-warming complete");
    Ok(())
}

fn warm_once(model: &Llama, tokens: &Tensor, prompt_len: usize, steps: usize) -> LlamaResult<()> {
    let mut cache = model.new_cache();
    model.generate_step(tokens, 0, &Prefix::none(), &mut cache)?;
    let last = tokens.narrow(1, prompt_len - 1, 1)?;
    for step in 0..steps {
        model.generate_step(&last, prompt_len + step, &Prefix::none(), &mut cache)?;
    }
    Ok(())
}
