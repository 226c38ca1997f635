//! Multi-head causal self-attention.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::VarBuilder;
use llama_core::{LlamaError, LlamaResult};

use crate::cache::LayerKvCache;
use crate::config::{AttentionBackend, ModelConfig};
use crate::layers::RotarySlice;
use crate::lora::Projection;

/// Large negative starting value for the running maximum of the online
/// softmax. Finite, so fully masked blocks never produce `-inf - -inf`.
const RUNNING_MAX_INIT: f64 = -1e30;

/// Multi-head self-attention with optional low-rank adapters.
#[derive(Debug)]
pub struct Attention {
    wq: Projection,
    wk: Projection,
    wv: Projection,
    wo: Projection,
    n_heads: usize,
    head_dim: usize,
    backend: AttentionBackend,
}

impl Attention {
    /// Create a new attention layer.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let inner = config.n_heads * head_dim;
        let adapter = &config.adapter;

        Ok(Self {
            wq: Projection::new(config.dim, inner, "wq", adapter, &vb)?,
            wk: Projection::new(config.dim, inner, "wk", adapter, &vb)?,
            wv: Projection::new(config.dim, inner, "wv", adapter, &vb)?,
            wo: Projection::new(inner, config.dim, "wo", adapter, &vb)?,
            n_heads: config.n_heads,
            head_dim,
            backend: config.attention_backend,
        })
    }

    /// Score strategy in use.
    pub fn backend(&self) -> AttentionBackend {
        self.backend
    }

    /// Forward pass with optional KV cache.
    ///
    /// `x` is `(batch, seq, dim)` and already normalized. When `cache` is
    /// given, the new keys/values are appended to it and attention runs over
    /// the whole cached history.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotarySlice,
        mask: Option<&Tensor>,
        cache: Option<&mut LayerKvCache>,
        train: bool,
    ) -> LlamaResult<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        let shape = (batch_size, seq_len, self.n_heads, self.head_dim);

        let q = self.wq.forward_t(x, train)?.reshape(shape)?;
        let k = self.wk.forward_t(x, train)?.reshape(shape)?;
        let v = self.wv.forward_t(x, train)?.reshape(shape)?;

        // values carry no position
        let (q, k) = rope.apply(&q, &k)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };

        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        if let Some(mask) = mask {
            let (q_len, k_len) = (q.dim(2)?, k.dim(2)?);
            let mask_dims = mask.dims();
            if mask_dims.len() < 2 || mask_dims[mask_dims.len() - 2..] != [q_len, k_len] {
                return Err(LlamaError::shape_mismatch(format!(
                    "attention mask {mask_dims:?} does not end in ({q_len}, {k_len})"
                )));
            }
        }

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = match self.backend {
            AttentionBackend::Explicit => explicit_attention(&q, &k, &v, mask, scale)?,
            AttentionBackend::MemoryEfficient { block_size } => {
                blockwise_attention(&q, &k, &v, mask, scale, block_size)?
            }
        };

        let attn = attn
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.n_heads * self.head_dim))?;

        Ok(self.wo.forward_t(&attn, train)?)
    }
}

/// Scaled dot-product attention over an explicit score matrix.
///
/// `q` is `(batch, heads, q_len, head_dim)`, `k`/`v` are
/// `(batch, heads, k_len, head_dim)`, and `mask` broadcasts to
/// `(batch, heads, q_len, k_len)`.
pub fn explicit_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor> {
    let dtype = q.dtype();
    let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?.to_dtype(DType::F32)?;
    let scores = match mask {
        Some(mask) => scores.broadcast_add(&mask.to_dtype(DType::F32)?)?,
        None => scores,
    };
    let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(dtype)?;
    probs.matmul(v)
}

/// Scaled dot-product attention computed one key block at a time.
///
/// Keeps a running row maximum and normalizer (online softmax), so only a
/// `(q_len, block_size)` score tile exists at any moment. Accepts the same
/// additive mask as [`explicit_attention`].
pub fn blockwise_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    scale: f64,
    block_size: usize,
) -> Result<Tensor> {
    let dtype = q.dtype();
    let (b, h, q_len, head_dim) = q.dims4()?;
    let k_len = k.dim(2)?;
    let device = q.device();

    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;
    let mask = mask.map(|m| m.to_dtype(DType::F32)).transpose()?;

    let mut running_max = Tensor::full(RUNNING_MAX_INIT as f32, (b, h, q_len, 1), device)?;
    let mut normalizer = Tensor::zeros((b, h, q_len, 1), DType::F32, device)?;
    let mut acc = Tensor::zeros((b, h, q_len, head_dim), DType::F32, device)?;

    let mut start = 0;
    while start < k_len {
        let len = block_size.min(k_len - start);
        let k_blk = k.narrow(2, start, len)?;
        let v_blk = v.narrow(2, start, len)?.contiguous()?;

        let mut scores = (q.matmul(&k_blk.t()?.contiguous()?)? * scale)?;
        if let Some(mask) = &mask {
            scores = scores.broadcast_add(&mask.narrow(D::Minus1, start, len)?)?;
        }

        let block_max = scores.max_keepdim(D::Minus1)?;
        let new_max = running_max.maximum(&block_max)?;
        let probs = scores.broadcast_sub(&new_max)?.exp()?;
        let correction = (&running_max - &new_max)?.exp()?;

        normalizer = ((normalizer * &correction)? + probs.sum_keepdim(D::Minus1)?)?;
        acc = (acc.broadcast_mul(&correction)? + probs.matmul(&v_blk)?)?;
        running_max = new_max;
        start += len;
    }

    acc.broadcast_div(&normalizer)?.to_dtype(dtype)
}

/// Additive causal mask of shape `(1, 1, q_len, k_len)`.
///
/// Query `i` sits at key position `k_len - q_len + i`; every later key is
/// set to `-inf`.
pub fn causal_mask(q_len: usize, k_len: usize, device: &Device) -> LlamaResult<Tensor> {
    if q_len > k_len {
        return Err(LlamaError::shape_mismatch(format!(
            "causal mask needs k_len >= q_len, got q_len {q_len}, k_len {k_len}"
        )));
    }
    let offset = k_len - q_len;
    let data: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..k_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    Ok(Tensor::from_vec(data, (1, 1, q_len, k_len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::layers::RotaryTable;
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_causal_mask_layout() {
        let device = Device::Cpu;
        let mask = causal_mask(2, 4, &device).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 2, 4]);

        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][..3], [0.0, 0.0, 0.0]);
        assert_eq!(rows[0][3], f32::NEG_INFINITY);
        assert!(rows[1].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_blockwise_matches_explicit() {
        let device = Device::Cpu;
        let q = Tensor::randn(0.0f32, 1.0, (2, 3, 5, 8), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (2, 3, 7, 8), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (2, 3, 7, 8), &device).unwrap();
        let mask = causal_mask(5, 7, &device).unwrap();
        let scale = 1.0 / 8f64.sqrt();

        let reference = explicit_attention(&q, &k, &v, Some(&mask), scale).unwrap();
        for block_size in [1, 3, 7, 16] {
            let blocked = blockwise_attention(&q, &k, &v, Some(&mask), scale, block_size).unwrap();
            assert!(max_abs_diff(&reference, &blocked) < 1e-5, "block {block_size}");
        }
    }

    #[test]
    fn test_attention_forward_with_cache() {
        let device = Device::Cpu;
        let config = ModelConfig {
            adapter: AdapterConfig::disabled(),
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(&config, vb).unwrap();
        let table = RotaryTable::new(config.head_dim(), 32, config.rope_theta, &device).unwrap();

        let mut cache = LayerKvCache::new(32);
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, config.dim), &device).unwrap();
        let mask = causal_mask(4, 4, &device).unwrap();
        let out = attn
            .forward(&x, &table.slice(0, 4).unwrap(), Some(&mask), Some(&mut cache), false)
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, config.dim]);
        assert_eq!(cache.seq_len(), 4);

        let step = Tensor::randn(0.0f32, 1.0, (1, 1, config.dim), &device).unwrap();
        let out = attn
            .forward(&step, &table.slice(4, 1).unwrap(), None, Some(&mut cache), false)
            .unwrap();
        assert_eq!(out.dims(), &[1, 1, config.dim]);
        assert_eq!(cache.seq_len(), 5);
    }

    #[test]
    fn test_attention_rejects_mismatched_mask() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(&config, vb).unwrap();
        let table = RotaryTable::new(config.head_dim(), 32, config.rope_theta, &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 3, config.dim), &device).unwrap();
        let mask = causal_mask(2, 2, &device).unwrap();
        let err = attn
            .forward(&x, &table.slice(0, 3).unwrap(), Some(&mask), None, false)
            .unwrap_err();
        assert!(matches!(err, LlamaError::ShapeMismatch(_)));
    }
}
