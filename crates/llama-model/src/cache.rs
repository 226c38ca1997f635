//! Incremental key/value cache for autoregressive generation.
//!
//! One [`IncrementalCache`] belongs to one generation session. It holds a
//! [`LayerKvCache`] per transformer layer, indexed by layer id, plus the
//! priming bookkeeping that keeps later positions aligned with the cache.

use candle_core::{Device, Tensor};
use llama_core::{LlamaError, LlamaResult};

/// Where a session is in its decode lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePhase {
    /// Nothing cached yet; the next step must start at position 0.
    Uninitialized,
    /// The full prefix has been embedded and cached.
    Primed,
    /// At least one token has been appended after priming.
    Streaming,
}

/// Cached keys and values of a single layer.
///
/// Both tensors are laid out `(batch, accumulated_len, heads, head_dim)` and
/// only ever grow within a session.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
    capacity: usize,
}

impl LayerKvCache {
    /// Create an empty layer cache addressing at most `capacity` positions.
    pub fn new(capacity: usize) -> Self {
        Self {
            k: None,
            v: None,
            capacity,
        }
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.k.as_ref().map_or(0, |k| k.dims()[1])
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    /// Cached keys, if any.
    pub fn keys(&self) -> Option<&Tensor> {
        self.k.as_ref()
    }

    /// Cached values, if any.
    pub fn values(&self) -> Option<&Tensor> {
        self.v.as_ref()
    }

    /// Append new keys/values behind the cached ones and return the full
    /// key/value tensors to attend over.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> LlamaResult<(Tensor, Tensor)> {
        let (b, s, h, d) = k.dims4()?;
        if v.dims() != k.dims() {
            return Err(LlamaError::shape_mismatch(format!(
                "key shape {:?} differs from value shape {:?}",
                k.dims(),
                v.dims()
            )));
        }
        let requested = self.seq_len() + s;
        if requested > self.capacity {
            return Err(LlamaError::PositionOutOfRange {
                requested,
                capacity: self.capacity,
            });
        }

        let (k, v) = match (&self.k, &self.v) {
            (Some(prev_k), Some(prev_v)) => {
                let (pb, _, ph, pd) = prev_k.dims4()?;
                if (pb, ph, pd) != (b, h, d) {
                    return Err(LlamaError::cache_state(format!(
                        "cached (batch, heads, head_dim) = {:?}, new chunk has {:?}",
                        (pb, ph, pd),
                        (b, h, d)
                    )));
                }
                (Tensor::cat(&[prev_k, k], 1)?, Tensor::cat(&[prev_v, v], 1)?)
            }
            _ => (k.clone(), v.clone()),
        };

        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    /// Select batch rows `new_order` from the cached tensors.
    pub fn reorder(&mut self, new_order: &Tensor) -> LlamaResult<()> {
        if let Some(k) = &self.k {
            self.k = Some(k.index_select(new_order, 0)?);
        }
        if let Some(v) = &self.v {
            self.v = Some(v.index_select(new_order, 0)?);
        }
        Ok(())
    }

    /// Drop all cached positions.
    pub fn clear(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// Per-session cache for every layer of the stack.
#[derive(Debug, Clone)]
pub struct IncrementalCache {
    layers: Vec<LayerKvCache>,
    phase: DecodePhase,
    prefix_len: usize,
}

impl IncrementalCache {
    /// Create an empty cache for `num_layers` layers.
    pub fn new(num_layers: usize, capacity: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerKvCache::new(capacity)).collect(),
            phase: DecodePhase::Uninitialized,
            prefix_len: 0,
        }
    }

    /// Number of layers covered.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    /// Length of the non-text prefix (left prompt + audio) injected at priming.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// Number of cached positions. Every layer holds the same count.
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, LayerKvCache::seq_len)
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batch size of the cached tensors, if primed.
    pub fn batch_size(&self) -> Option<usize> {
        self.layers
            .first()
            .and_then(LayerKvCache::keys)
            .map(|k| k.dims()[0])
    }

    /// Cache of layer `layer_id`.
    pub fn layer(&self, layer_id: usize) -> Option<&LayerKvCache> {
        self.layers.get(layer_id)
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [LayerKvCache] {
        &mut self.layers
    }

    pub(crate) fn mark_primed(&mut self, prefix_len: usize) {
        self.phase = DecodePhase::Primed;
        self.prefix_len = prefix_len;
    }

    pub(crate) fn mark_streaming(&mut self) {
        self.phase = DecodePhase::Streaming;
    }

    /// Forget everything so the cache can serve a new sequence.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
        self.phase = DecodePhase::Uninitialized;
        self.prefix_len = 0;
    }

    /// Reorder the batch dimension of every cached tensor, in place.
    ///
    /// `new_order` holds row indices into the current batch; it may repeat or
    /// drop rows (beam search). Layers with nothing cached are left untouched.
    pub fn reorder(&mut self, new_order: &[u32]) -> LlamaResult<()> {
        let Some(batch) = self.batch_size() else {
            return Ok(());
        };
        if let Some(&bad) = new_order.iter().find(|&&i| i as usize >= batch) {
            return Err(LlamaError::cache_state(format!(
                "reorder index {bad} out of range for cached batch of {batch}"
            )));
        }
        let device = self
            .layers
            .first()
            .and_then(LayerKvCache::keys)
            .map_or(Device::Cpu, |k| k.device().clone());
        let order = Tensor::from_slice(new_order, new_order.len(), &device)?;
        for layer in &mut self.layers {
            layer.reorder(&order)?;
        }
        Ok(())
    }
}
