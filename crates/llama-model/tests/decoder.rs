//! End-to-end checks of the decoder's two code paths.

use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{VarBuilder, VarMap};
use llama_core::LlamaError;
use llama_model::{
    AdapterConfig, AttentionBackend, IncrementalCache, Llama, ModelConfig, Prefix, WeightMap,
};

fn small_config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        n_layers: 2,
        n_heads: 2,
        vocab_size: 10,
        multiple_of: 8,
        max_seq_len: 16,
        adapter: AdapterConfig::disabled(),
        ..ModelConfig::tiny()
    }
}

fn build(config: ModelConfig, varmap: &VarMap) -> Llama {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Llama::new(config, vb).unwrap()
}

fn ids(values: &[u32]) -> Tensor {
    Tensor::new(values, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
}

fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    let (a, b) = (to_vec(a), to_vec(b));
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {i}: {x} vs {y}");
    }
}

fn snapshot(varmap: &VarMap) -> WeightMap {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().copy().unwrap()))
        .collect()
}

#[test]
fn primed_last_position_matches_full_forward() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);

    let full = model.forward(&ids(&[1, 2, 3])).unwrap();
    assert_eq!(full.dims(), &[1, 3, 10]);

    let mut cache = model.new_cache();
    let step = model
        .generate_step(&ids(&[1, 2, 3]), 0, &Prefix::none(), &mut cache)
        .unwrap();
    assert_eq!(step.logits.dims(), &[1, 10]);
    assert_close(&step.logits, &full.i((.., 2, ..)).unwrap(), 1e-4);
}

#[test]
fn incremental_steps_match_full_forward() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let tokens = [3u32, 1, 4, 1, 5, 9, 2, 6];
    let full = model.forward(&ids(&tokens)).unwrap();

    let mut cache = model.new_cache();
    let first = model
        .generate_step(&ids(&tokens[..1]), 0, &Prefix::none(), &mut cache)
        .unwrap();
    assert_close(&first.logits, &full.i((.., 0, ..)).unwrap(), 1e-4);

    for pos in 1..tokens.len() {
        // alternate between the single-token and full-history windows
        let window = if pos % 2 == 0 { &tokens[pos..=pos] } else { &tokens[..=pos] };
        let step = model
            .generate_step(&ids(window), pos, &Prefix::none(), &mut cache)
            .unwrap();
        assert_eq!(step.position, pos);
        assert_close(&step.logits, &full.i((.., pos, ..)).unwrap(), 1e-4);
    }
}

#[test]
fn incremental_steps_match_full_forward_with_audio_prefix() {
    let varmap = VarMap::new();
    let config = ModelConfig {
        adapter: AdapterConfig {
            enabled: true,
            rank: 2,
            alpha: 4.0,
            dropout: 0.1,
        },
        ..small_config()
    };
    let model = build(config, &varmap);

    let audio = Tensor::randn(0.0f32, 1.0, (1, 3, 8), &Device::Cpu).unwrap();
    let left = ids(&[7, 8]);
    let prefix = Prefix::with_left_prompt(&audio, &left);
    let tokens = [5u32, 6, 2, 4];

    let full = model.forward_t(&ids(&tokens), &prefix, false).unwrap();
    assert_eq!(full.dims(), &[1, 4, 10]);

    let mut cache = model.new_cache();
    let first = model
        .generate_step(&ids(&tokens[..1]), 0, &prefix, &mut cache)
        .unwrap();
    assert_eq!(first.chunk_len, 6);
    assert_close(&first.logits, &full.i((.., 0, ..)).unwrap(), 1e-4);

    for pos in 1..tokens.len() {
        let step = model
            .generate_step(&ids(&tokens[..=pos]), pos, &Prefix::none(), &mut cache)
            .unwrap();
        assert_eq!(step.position, pos + 5);
        assert_close(&step.logits, &full.i((.., pos, ..)).unwrap(), 1e-4);
    }
}

#[test]
fn memory_efficient_backend_matches_explicit() {
    let varmap = VarMap::new();
    let explicit = build(small_config(), &varmap);
    let blocked = build(
        ModelConfig {
            attention_backend: AttentionBackend::MemoryEfficient { block_size: 3 },
            ..small_config()
        },
        &varmap,
    );

    let tokens = ids(&[9, 8, 7, 6, 5, 4, 3]);
    let a = explicit.forward(&tokens).unwrap();
    let b = blocked.forward(&tokens).unwrap();
    assert_close(&a, &b, 1e-5);

    let mut cache = blocked.new_cache();
    blocked
        .generate_step(&ids(&[9, 8, 7]), 0, &Prefix::none(), &mut cache)
        .unwrap();
    let step = blocked
        .generate_step(&ids(&[6]), 3, &Prefix::none(), &mut cache)
        .unwrap();
    assert_close(&step.logits, &a.i((.., 3, ..)).unwrap(), 1e-4);
}

#[test]
fn zero_initialized_adapters_leave_base_model_unchanged() {
    let varmap = VarMap::new();
    let base = build(small_config(), &varmap);
    let weights = snapshot(&varmap);

    let adapted_config = ModelConfig {
        adapter: AdapterConfig {
            enabled: true,
            rank: 4,
            alpha: 8.0,
            dropout: 0.0,
        },
        ..small_config()
    };
    let adapted = Llama::from_weight_map(adapted_config, weights, &Device::Cpu).unwrap();

    let tokens = ids(&[1, 2, 3, 4, 5]);
    let expected = base.forward(&tokens).unwrap();
    let actual = adapted.forward(&tokens).unwrap();
    assert_close(&expected, &actual, 1e-6);
}

#[test]
fn cache_grows_by_one_per_streaming_step() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let audio = Tensor::randn(0.0f32, 1.0, (1, 2, 8), &Device::Cpu).unwrap();

    let mut cache = model.new_cache();
    model
        .generate_step(&ids(&[1, 2, 3]), 0, &Prefix::audio(&audio), &mut cache)
        .unwrap();
    let primed = cache.len();
    assert_eq!(primed, 5);

    for n in 1..=4 {
        model
            .generate_step(&ids(&[4]), 2 + n, &Prefix::none(), &mut cache)
            .unwrap();
        assert_eq!(cache.len(), primed + n);
        for layer in 0..cache.num_layers() {
            assert_eq!(cache.layer(layer).unwrap().seq_len(), primed + n);
        }
    }
}

#[test]
fn audio_prefix_offsets_streaming_position() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let audio = Tensor::randn(0.0f32, 1.0, (1, 4, 8), &Device::Cpu).unwrap();
    let prefix = Prefix::audio(&audio);

    let mut cache = model.new_cache();
    let primed = model
        .generate_step(&ids(&[5, 6]), 0, &prefix, &mut cache)
        .unwrap();
    assert_eq!(primed.position, 0);
    assert_eq!(primed.chunk_len, 6);
    assert_eq!(cache.prefix_len(), 4);

    let step = model
        .generate_step(&ids(&[5, 6, 1]), 2, &prefix, &mut cache)
        .unwrap();
    assert_eq!(step.position, 6);
    assert_eq!(cache.len(), 7);
}

fn cached_keys(cache: &IncrementalCache) -> Vec<Vec<f32>> {
    (0..cache.num_layers())
        .flat_map(|i| {
            let layer = cache.layer(i).unwrap();
            [to_vec(layer.keys().unwrap()), to_vec(layer.values().unwrap())]
        })
        .collect()
}

#[test]
fn identity_reorder_is_bitwise_noop() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let tokens = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();

    let mut cache = model.new_cache();
    model
        .generate_step(&tokens, 0, &Prefix::none(), &mut cache)
        .unwrap();
    let before = cached_keys(&cache);

    model.reorder_cache(&mut cache, &[0, 1]).unwrap();
    let after = cached_keys(&cache);
    assert_eq!(
        before.iter().map(|v| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>()).collect::<Vec<_>>(),
        after.iter().map(|v| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>()).collect::<Vec<_>>()
    );
}

#[test]
fn reorder_follows_beam_rows() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let swapped = Tensor::new(&[[4u32, 5, 6], [1, 2, 3]], &Device::Cpu).unwrap();
    let tokens = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();

    let mut reordered = model.new_cache();
    model
        .generate_step(&tokens, 0, &Prefix::none(), &mut reordered)
        .unwrap();
    model.reorder_cache(&mut reordered, &[1, 0]).unwrap();

    let mut reference = model.new_cache();
    model
        .generate_step(&swapped, 0, &Prefix::none(), &mut reference)
        .unwrap();

    let next = Tensor::new(&[[7u32], [8]], &Device::Cpu).unwrap();
    let a = model
        .generate_step(&next, 3, &Prefix::none(), &mut reordered)
        .unwrap();
    let b = model
        .generate_step(&next, 3, &Prefix::none(), &mut reference)
        .unwrap();
    assert_close(&a.logits, &b.logits, 1e-5);

    assert!(matches!(
        model.reorder_cache(&mut reordered, &[2]),
        Err(LlamaError::CacheStateError(_))
    ));
}

#[test]
fn streaming_before_priming_is_rejected() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let mut cache = model.new_cache();
    let err = model
        .generate_step(&ids(&[1]), 3, &Prefix::none(), &mut cache)
        .unwrap_err();
    assert!(matches!(err, LlamaError::CacheStateError(_)));
    assert!(cache.is_empty());
}

#[test]
fn out_of_vocabulary_token_is_rejected() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let mut cache = model.new_cache();
    let err = model
        .generate_step(&ids(&[1, 10]), 0, &Prefix::none(), &mut cache)
        .unwrap_err();
    assert!(matches!(
        err,
        LlamaError::InvalidTokenId {
            id: 10,
            vocab_size: 10
        }
    ));
    assert!(cache.is_empty());
}

#[test]
fn position_capacity_is_enforced() {
    let varmap = VarMap::new();
    let model = build(
        ModelConfig {
            max_seq_len: 2,
            ..small_config()
        },
        &varmap,
    );
    let mut cache = model.new_cache();
    model
        .generate_step(&ids(&[1, 2, 3, 4]), 0, &Prefix::none(), &mut cache)
        .unwrap();
    let err = model
        .generate_step(&ids(&[5]), 4, &Prefix::none(), &mut cache)
        .unwrap_err();
    assert!(matches!(
        err,
        LlamaError::PositionOutOfRange {
            requested: 5,
            capacity: 4
        }
    ));
    assert_eq!(cache.len(), 4);
}

#[test]
fn indivisible_head_count_is_rejected() {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = ModelConfig {
        dim: 10,
        n_heads: 3,
        ..small_config()
    };
    assert!(matches!(
        Llama::new(config, vb),
        Err(LlamaError::ShapeMismatch(_))
    ));
}

#[test]
fn checkpoint_round_trip_and_strict_loading() {
    let varmap = VarMap::new();
    let model = build(small_config(), &varmap);
    let weights = snapshot(&varmap);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    candle_core::safetensors::save(&weights, &path).unwrap();

    let loaded = Llama::load(&path, small_config(), &Device::Cpu).unwrap();
    let tokens = ids(&[2, 4, 6]);
    assert_close(
        &model.forward(&tokens).unwrap(),
        &loaded.forward(&tokens).unwrap(),
        1e-6,
    );

    let mut partial = weights;
    partial.remove("layers.0.attention.wq.weight");
    assert!(matches!(
        Llama::from_weight_map(small_config(), partial, &Device::Cpu),
        Err(LlamaError::MissingWeight(name)) if name == "layers.0.attention.wq.weight"
    ));
}
