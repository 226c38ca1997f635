//! Low-rank adapters on linear projections.
//!
//! An adapted projection computes
//! `base(x) + dropout(x) @ A @ B * (alpha / rank)`. Dropout touches only the
//! adapter branch, so the base path is never perturbed during fine-tuning.
//! `B` starts at zero, which makes a freshly attached adapter a no-op.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Init, Linear, Module, ModuleT, VarBuilder, linear_no_bias};

use crate::config::AdapterConfig;

/// Parameter name suffix of the down-projection factor.
pub const LORA_A: &str = "lora_A";
/// Parameter name suffix of the up-projection factor.
pub const LORA_B: &str = "lora_B";

/// Initialization hint for the `A` factor: uniform in `±1/sqrt(rank)`.
pub fn lora_a_init(rank: usize) -> Init {
    let bound = 1.0 / (rank as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// The additive low-rank branch.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Down-projection `(in_dim, rank)`.
    a: Tensor,
    /// Up-projection `(rank, out_dim)`.
    b: Tensor,
    scaling: f64,
    dropout: Option<Dropout>,
}

impl LoraAdapter {
    /// Build an adapter for `name` (e.g. `wq`) from the enclosing builder.
    ///
    /// Parameters are looked up as `{name}_lora_A` and `{name}_lora_B`.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        name: &str,
        config: &AdapterConfig,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let a = vb.get_with_hints(
            (in_dim, config.rank),
            &format!("{name}_{LORA_A}"),
            lora_a_init(config.rank),
        )?;
        let b = vb.get_with_hints(
            (config.rank, out_dim),
            &format!("{name}_{LORA_B}"),
            Init::Const(0.0),
        )?;
        Ok(Self::from_factors(a, b, config.scaling(), config.dropout))
    }

    /// Build an adapter from explicit factors.
    pub fn from_factors(a: Tensor, b: Tensor, scaling: f64, dropout: f32) -> Self {
        let dropout = (dropout > 0.0).then(|| Dropout::new(dropout));
        Self {
            a,
            b,
            scaling,
            dropout,
        }
    }

    /// Rank of the factorization.
    pub fn rank(&self) -> usize {
        self.b.dims()[0]
    }

    /// Add the low-rank correction for input `x` to `base_output`.
    pub fn forward(&self, x: &Tensor, base_output: &Tensor, train: bool) -> Result<Tensor> {
        let x = match &self.dropout {
            Some(dropout) => dropout.forward_t(x, train)?,
            None => x.clone(),
        };
        let delta = x.broadcast_matmul(&self.a)?.broadcast_matmul(&self.b)?;
        base_output + (delta * self.scaling)?
    }
}

/// A bias-free linear projection with or without an adapter.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Base projection only.
    Plain(Linear),
    /// Base projection plus a low-rank correction.
    Adapted { base: Linear, adapter: LoraAdapter },
}

impl Projection {
    /// Build the projection `{name}.weight`, attaching `{name}_lora_{A,B}`
    /// when adapters are enabled.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        name: &str,
        config: &AdapterConfig,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let base = linear_no_bias(in_dim, out_dim, vb.pp(name))?;
        if !config.enabled {
            return Ok(Self::Plain(base));
        }
        let adapter = LoraAdapter::new(in_dim, out_dim, name, config, vb)?;
        Ok(Self::Adapted { base, adapter })
    }

    /// Whether an adapter is attached.
    pub fn is_adapted(&self) -> bool {
        matches!(self, Self::Adapted { .. })
    }

    /// Project `x`; `train` enables adapter dropout.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Plain(base) => base.forward(x),
            Self::Adapted { base, adapter } => {
                let base_output = base.forward(x)?;
                adapter.forward(x, &base_output, train)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_zero_b_adapter_is_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = AdapterConfig {
            enabled: true,
            rank: 4,
            alpha: 16.0,
            dropout: 0.0,
        };

        let proj = Projection::new(16, 16, "wq", &config, &vb).unwrap();
        assert!(proj.is_adapted());

        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device).unwrap();
        let Projection::Adapted { base, .. } = &proj else {
            panic!("expected adapted projection");
        };
        let expected = base.forward(&x).unwrap();
        let actual = proj.forward_t(&x, false).unwrap();
        assert_eq!(to_vec(&expected), to_vec(&actual));
    }

    #[test]
    fn test_adapter_parameter_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = AdapterConfig {
            rank: 2,
            ..Default::default()
        };
        Projection::new(8, 8, "wk", &config, &vb.pp("attention")).unwrap();

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["attention.wk.weight"].dims(), &[8, 8]);
        assert_eq!(data["attention.wk_lora_A"].dims(), &[8, 2]);
        assert_eq!(data["attention.wk_lora_B"].dims(), &[2, 8]);
    }

    #[test]
    fn test_nonzero_adapter_adds_scaled_product() {
        let device = Device::Cpu;
        let a = Tensor::ones((2, 1), DType::F32, &device).unwrap();
        let b = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let adapter = LoraAdapter::from_factors(a, b, 0.5, 0.0);

        let x = Tensor::from_vec(vec![1.0f32, 3.0], (1, 1, 2), &device).unwrap();
        let base = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
        let out = adapter.forward(&x, &base, false).unwrap();
        // (1 + 3) * 0.5 on each output channel
        assert_eq!(to_vec(&out), vec![2.0, 2.0]);
    }

    #[test]
    fn test_dropout_inactive_in_eval() {
        let device = Device::Cpu;
        let a = Tensor::ones((2, 1), DType::F32, &device).unwrap();
        let b = Tensor::ones((1, 2), DType::F32, &device).unwrap();
        let adapter = LoraAdapter::from_factors(a, b, 1.0, 0.5);

        let x = Tensor::ones((1, 4, 2), DType::F32, &device).unwrap();
        let base = Tensor::zeros((1, 4, 2), DType::F32, &device).unwrap();
        let out = adapter.forward(&x, &base, false).unwrap();
        assert!(to_vec(&out).iter().all(|v| (*v - 2.0).abs() < 1e-6));
    }
}
