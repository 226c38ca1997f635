//! Neural network layers for the decoder.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder, linear_no_bias};
use llama_core::{LlamaError, LlamaResult};

use crate::attention::Attention;
use crate::cache::LayerKvCache;
use crate::config::ModelConfig;

/// RMSNorm layer for pre-normalization.
///
/// No bias and no mean subtraction: `x / sqrt(mean(x^2) + eps) * weight`.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer. A fresh builder initializes the scale to ones.
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    /// Create RMSNorm with ones initialization (for testing).
    pub fn new_ones(dim: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(dim, DType::F32, device)?;
        Ok(Self { weight, eps })
    }

    /// Apply RMSNorm to the input tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (mean_sq + self.eps)?.sqrt()?;
        let normalized = x.broadcast_div(&rms)?.to_dtype(dtype)?;

        normalized.broadcast_mul(&self.weight)
    }
}

/// Precomputed rotary position factors.
///
/// Holds `cos`/`sin` of `t * theta^(-2i/head_dim)` for every position `t`
/// in `[0, capacity)` and pair index `i` in `[0, head_dim / 2)`. The table
/// is immutable after construction and is shared by every layer.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    cos: Tensor,
    sin: Tensor,
    head_dim: usize,
    capacity: usize,
}

impl RotaryTable {
    /// Build the table for `capacity` positions.
    pub fn new(head_dim: usize, capacity: usize, theta: f64, device: &Device) -> LlamaResult<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(LlamaError::shape_mismatch(format!(
                "rotary head dimension {head_dim} must be even and non-zero"
            )));
        }
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, capacity as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((capacity, 1))?;

        let angles = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
            head_dim,
            capacity,
        })
    }

    /// Head dimension the table was built for.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Number of addressable positions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rotation factors for positions `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> LlamaResult<RotarySlice> {
        let end = start + len;
        if end > self.capacity {
            return Err(LlamaError::PositionOutOfRange {
                requested: end,
                capacity: self.capacity,
            });
        }
        Ok(RotarySlice {
            cos: self.cos.narrow(0, start, len)?,
            sin: self.sin.narrow(0, start, len)?,
            start,
            head_dim: self.head_dim,
        })
    }
}

/// A contiguous window of the rotary table.
#[derive(Debug, Clone)]
pub struct RotarySlice {
    cos: Tensor,
    sin: Tensor,
    start: usize,
    head_dim: usize,
}

impl RotarySlice {
    /// First absolute position covered.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Whether the slice covers no positions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotate queries and keys shaped `(batch, seq, heads, head_dim)`.
    pub fn apply(&self, q: &Tensor, k: &Tensor) -> LlamaResult<(Tensor, Tensor)> {
        Ok((self.rotate(q)?, self.rotate(k)?))
    }

    /// Treat the last dimension as `head_dim / 2` interleaved (re, im) pairs
    /// and multiply each pair by its position's unit complex factor.
    pub fn rotate(&self, x: &Tensor) -> LlamaResult<Tensor> {
        let (b, s, h, d) = x.dims4()?;
        if d != self.head_dim {
            return Err(LlamaError::shape_mismatch(format!(
                "rotary table built for head_dim {}, got {d}",
                self.head_dim
            )));
        }
        if s != self.len() {
            return Err(LlamaError::shape_mismatch(format!(
                "rotary slice covers {} positions, input has {s}",
                self.len()
            )));
        }
        let half = d / 2;
        let dtype = x.dtype();
        let pairs = x.to_dtype(DType::F32)?.reshape((b, s, h, half, 2))?;
        let re = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let im = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let cos = self.cos.reshape((1, s, 1, half))?;
        let sin = self.sin.reshape((1, s, 1, half))?;

        let out_re = (re.broadcast_mul(&cos)? - im.broadcast_mul(&sin)?)?;
        let out_im = (re.broadcast_mul(&sin)? + im.broadcast_mul(&cos)?)?;

        let rotated = Tensor::stack(&[out_re, out_im], 4)?
            .reshape((b, s, h, d))?
            .to_dtype(dtype)?;
        Ok(rotated)
    }
}

/// Position-wise SwiGLU feed-forward block.
#[derive(Debug)]
pub struct FeedForward {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl FeedForward {
    /// Create a new feed-forward block.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.ffn_hidden_dim();
        Ok(Self {
            w1: linear_no_bias(config.dim, hidden, vb.pp("w1"))?,
            w2: linear_no_bias(hidden, config.dim, vb.pp("w2"))?,
            w3: linear_no_bias(config.dim, hidden, vb.pp("w3"))?,
        })
    }

    /// `w2(silu(w1 x) * w3 x)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        self.w2.forward(&(gate * up)?)
    }
}

/// Transformer decoder block.
#[derive(Debug)]
pub struct TransformerBlock {
    attention_norm: RmsNorm,
    attention: Attention,
    ffn_norm: RmsNorm,
    feed_forward: FeedForward,
    layer_id: usize,
}

impl TransformerBlock {
    /// Create a new transformer block.
    pub fn new(layer_id: usize, config: &ModelConfig, vb: VarBuilder) -> LlamaResult<Self> {
        let attention_norm = RmsNorm::new(config.dim, config.norm_eps, vb.pp("attention_norm"))?;
        let attention = Attention::new(config, vb.pp("attention"))?;
        let ffn_norm = RmsNorm::new(config.dim, config.norm_eps, vb.pp("ffn_norm"))?;
        let feed_forward = FeedForward::new(config, vb.pp("feed_forward"))?;

        Ok(Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_id,
        })
    }

    /// Index of this block in the stack.
    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Both sub-blocks read normalized input and add into the raw residual stream.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotarySlice,
        mask: Option<&Tensor>,
        cache: Option<&mut LayerKvCache>,
        train: bool,
    ) -> LlamaResult<Tensor> {
        let normed = self.attention_norm.forward(x)?;
        let attn_out = self.attention.forward(&normed, rope, mask, cache, train)?;
        let h = (x + attn_out)?;

        let normed = self.ffn_norm.forward(&h)?;
        let ffn_out = self.feed_forward.forward(&normed)?;
        Ok((h + ffn_out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_rms() {
        let device = Device::Cpu;
        let norm = RmsNorm::new_ones(64, 1e-6, &device).unwrap();

        let x = Tensor::randn(0.0f32, 3.0, (2, 10, 64), &device).unwrap();
        let output = norm.forward(&x).unwrap();
        assert_eq!(output.dims(), x.dims());

        let rms: Vec<f32> = output
            .sqr()
            .unwrap()
            .mean_keepdim(D::Minus1)
            .unwrap()
            .sqrt()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for r in rms {
            assert!((r - 1.0).abs() < 1e-3, "rms {r}");
        }
    }

    #[test]
    fn test_rms_norm_preserves_dtype() {
        let device = Device::Cpu;
        let norm = RmsNorm::new_ones(8, 1e-6, &device).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 8), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let norm = RmsNorm {
            weight: norm.weight.to_dtype(DType::F16).unwrap(),
            eps: norm.eps,
        };
        assert_eq!(norm.forward(&x).unwrap().dtype(), DType::F16);
    }

    #[test]
    fn test_rotary_identity_at_position_zero() {
        let device = Device::Cpu;
        let table = RotaryTable::new(8, 16, 10000.0, &device).unwrap();
        let slice = table.slice(0, 1).unwrap();

        let q = Tensor::randn(0.0f32, 1.0, (1, 1, 2, 8), &device).unwrap();
        let rotated: Vec<f32> = slice.rotate(&q).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let original: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in rotated.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rotary_rotates_interleaved_pairs() {
        let device = Device::Cpu;
        // head_dim 2: a single pair with angle t at position t
        let table = RotaryTable::new(2, 4, 10000.0, &device).unwrap();
        let slice = table.slice(1, 1).unwrap();
        let x = Tensor::from_vec(vec![1.0f32, 0.0], (1, 1, 1, 2), &device).unwrap();
        let out: Vec<f32> = slice.rotate(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!((out[0] - 1.0f32.cos()).abs() < 1e-6);
        assert!((out[1] - 1.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_rotary_slice_out_of_range() {
        let device = Device::Cpu;
        let table = RotaryTable::new(8, 16, 10000.0, &device).unwrap();
        assert!(table.slice(10, 6).is_ok());
        assert!(matches!(
            table.slice(10, 7),
            Err(LlamaError::PositionOutOfRange {
                requested: 17,
                capacity: 16
            })
        ));
    }

    #[test]
    fn test_rotary_wrong_head_dim() {
        let device = Device::Cpu;
        let table = RotaryTable::new(8, 16, 10000.0, &device).unwrap();
        let slice = table.slice(0, 3).unwrap();
        let q = Tensor::zeros((1, 3, 2, 6), DType::F32, &device).unwrap();
        assert!(matches!(
            slice.rotate(&q),
            Err(LlamaError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_feed_forward_shape() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny();
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ffn = FeedForward::new(&config, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 5, config.dim), &device).unwrap();
        assert_eq!(ffn.forward(&x).unwrap().dims(), &[2, 5, config.dim]);
    }
}
