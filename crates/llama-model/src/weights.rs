//! Flat parameter maps: naming, validation and adapter back-filling.
//!
//! Loading is strict about base projections, embeddings and norm scales
//! (absent or mis-shaped tensors are errors) and tolerant about adapters
//! (absent factors are created with `B = 0`, so they start as a no-op).

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Shape, Tensor};
use llama_core::{LlamaError, LlamaResult};
use rand::SeedableRng;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::lora::{LORA_A, LORA_B, lora_a_init};

/// Parameter name to tensor.
pub type WeightMap = HashMap<String, Tensor>;

const ADAPTED_PROJECTIONS: [&str; 4] = ["wq", "wk", "wv", "wo"];

/// Names and shapes of every non-adapter parameter.
pub fn base_parameter_shapes(config: &ModelConfig) -> Vec<(String, Shape)> {
    let dim = config.dim;
    let inner = config.n_heads * config.head_dim();
    let hidden = config.ffn_hidden_dim();

    let mut shapes = vec![(
        "tok_embeddings.weight".to_string(),
        Shape::from((config.vocab_size, dim)),
    )];
    for i in 0..config.n_layers {
        let layer = format!("layers.{i}");
        for name in ["wq", "wk", "wv"] {
            shapes.push((format!("{layer}.attention.{name}.weight"), (inner, dim).into()));
        }
        shapes.push((format!("{layer}.attention.wo.weight"), (dim, inner).into()));
        shapes.push((format!("{layer}.feed_forward.w1.weight"), (hidden, dim).into()));
        shapes.push((format!("{layer}.feed_forward.w2.weight"), (dim, hidden).into()));
        shapes.push((format!("{layer}.feed_forward.w3.weight"), (hidden, dim).into()));
        shapes.push((format!("{layer}.attention_norm.weight"), dim.into()));
        shapes.push((format!("{layer}.ffn_norm.weight"), dim.into()));
    }
    shapes.push(("norm.weight".to_string(), dim.into()));
    shapes.push(("output.weight".to_string(), (config.vocab_size, dim).into()));
    shapes
}

/// Names and shapes of the adapter factors (empty when adapters are off).
pub fn adapter_parameter_shapes(config: &ModelConfig) -> Vec<(String, Shape)> {
    if !config.adapter.enabled {
        return Vec::new();
    }
    let rank = config.adapter.rank;
    let inner = config.n_heads * config.head_dim();
    let mut shapes = Vec::with_capacity(config.n_layers * ADAPTED_PROJECTIONS.len() * 2);
    for i in 0..config.n_layers {
        for name in ADAPTED_PROJECTIONS {
            let (in_dim, out_dim) = if name == "wo" {
                (inner, config.dim)
            } else {
                (config.dim, inner)
            };
            let prefix = format!("layers.{i}.attention.{name}");
            shapes.push((format!("{prefix}_{LORA_A}"), (in_dim, rank).into()));
            shapes.push((format!("{prefix}_{LORA_B}"), (rank, out_dim).into()));
        }
    }
    shapes
}

/// Names of the adapter factors, for adapter-only fine-tuning.
pub fn adapter_parameter_names(config: &ModelConfig) -> Vec<String> {
    adapter_parameter_shapes(config)
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

fn check_shape(name: &str, tensor: &Tensor, expected: &Shape) -> LlamaResult<()> {
    if tensor.shape() != expected {
        return Err(LlamaError::shape_mismatch(format!(
            "{name}: expected {expected:?}, found {:?}",
            tensor.shape()
        )));
    }
    Ok(())
}

/// Check a weight map against the configuration.
///
/// Every base parameter must be present with the exact shape. Adapter
/// factors may be absent, but a present one must have the right shape.
pub fn validate(config: &ModelConfig, weights: &WeightMap) -> LlamaResult<()> {
    for (name, shape) in base_parameter_shapes(config) {
        let tensor = weights
            .get(&name)
            .ok_or_else(|| LlamaError::missing_weight(name.clone()))?;
        check_shape(&name, tensor, &shape)?;
    }
    for (name, shape) in adapter_parameter_shapes(config) {
        if let Some(tensor) = weights.get(&name) {
            check_shape(&name, tensor, &shape)?;
        }
    }
    Ok(())
}

/// Create every absent adapter factor: `A` uniform in `±1/sqrt(rank)`, `B` zeros.
///
/// Returns the names that were filled in.
pub fn fill_missing_adapters(
    config: &ModelConfig,
    weights: &mut WeightMap,
    device: &Device,
    dtype: DType,
) -> LlamaResult<Vec<String>> {
    let mut filled = Vec::new();
    for (name, shape) in adapter_parameter_shapes(config) {
        if weights.contains_key(&name) {
            continue;
        }
        let tensor = if name.ends_with(LORA_A) {
            lora_a_init(config.adapter.rank).var(shape, dtype, device)?.into_inner()
        } else {
            Tensor::zeros(shape, dtype, device)?
        };
        debug!(%name, "initialized missing adapter parameter");
        weights.insert(name.clone(), tensor);
        filled.push(name);
    }
    if !filled.is_empty() {
        info!(count = filled.len(), "adapter parameters absent from checkpoint; starting as no-op");
    }
    Ok(filled)
}

/// Seeded random base parameters for running without a checkpoint.
///
/// Norm scales are ones; matrices are uniform in `±1/sqrt(fan_in)`. The
/// same seed always yields the same map.
pub fn random_init(config: &ModelConfig, seed: u64, device: &Device) -> LlamaResult<WeightMap> {
    let dtype: DType = config.dtype.into();
    let mut rng = StdRng::seed_from_u64(seed);
    base_parameter_shapes(config)
        .into_iter()
        .map(|(name, shape)| {
            let tensor = match shape.dims() {
                [_] => Tensor::ones(shape, dtype, device)?,
                dims => {
                    let bound = 1.0 / (dims[dims.len() - 1] as f32).sqrt();
                    let dist = Uniform::new_inclusive(-bound, bound);
                    let data: Vec<f32> = (0..shape.elem_count())
                        .map(|_| dist.sample(&mut rng))
                        .collect();
                    Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?
                }
            };
            Ok((name, tensor))
        })
        .collect()
}

/// Read every tensor of a safetensors checkpoint.
pub fn load_safetensors(path: impl AsRef<Path>, device: &Device) -> LlamaResult<WeightMap> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(LlamaError::ModelLoad {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
        });
    }
    Ok(candle_core::safetensors::load(path, device)?)
}
