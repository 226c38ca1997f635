//! Checkpoint inspection command implementation.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Device;
use llama_model::weights::{self, adapter_parameter_names, base_parameter_shapes};
use llama_model::ModelConfig;

/// What a checkpoint holds relative to a configuration.
#[derive(Debug, Default, PartialEq)]
pub struct Report {
    /// Number of tensors in the checkpoint.
    pub tensors: usize,
    /// Total scalar parameters in the checkpoint.
    pub parameters: usize,
    /// Adapter factors that loading would create.
    pub missing_adapters: Vec<String>,
    /// Tensors the model never reads.
    pub unused: Vec<String>,
}

/// Compare the tensors of a checkpoint with what `config` expects.
///
/// Fails on the first missing or mis-shaped base parameter.
pub fn inspect(config: &ModelConfig, weights: &weights::WeightMap) -> Result<Report> {
    config.validate()?;
    weights::validate(config, weights)?;

    let adapters = adapter_parameter_names(config);
    let known: HashSet<String> = base_parameter_shapes(config)
        .into_iter()
        .map(|(name, _)| name)
        .chain(adapters.iter().cloned())
        .collect();

    let mut unused: Vec<String> = weights
        .keys()
        .filter(|name| !known.contains(*name))
        .cloned()
        .collect();
    unused.sort();

    Ok(Report {
        tensors: weights.len(),
        parameters: weights.values().map(|t| t.elem_count()).sum(),
        missing_adapters: adapters
            .into_iter()
            .filter(|name| !weights.contains_key(name))
            .collect(),
        unused,
    })
}

/// Run the inspect command.
pub fn run(config_path: &Path, weights_path: &Path) -> Result<()> {
    let config = ModelConfig::from_file(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let weights = weights::load_safetensors(weights_path, &Device::Cpu)?;
    let report = inspect(&config, &weights).context("checkpoint does not match configuration")?;

    println!("Configuration:");
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!();
    println!("Checkpoint: {}", weights_path.display());
    println!("  tensors:    {}", report.tensors);
    println!("  parameters: {}", report.parameters);
    if config.adapter.enabled {
        println!(
            "  adapters:   {} of {} missing (initialized as no-op on load)",
            report.missing_adapters.len(),
            adapter_parameter_names(&config).len()
        );
        for name in &report.missing_adapters {
            println!("    {name}");
        }
    }
    if !report.unused.is_empty() {
        println!("  unused tensors: {}", report.unused.len());
        for name in &report.unused {
            println!("    {name}");
        }
    }
    Ok(())
}
