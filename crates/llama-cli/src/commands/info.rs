//! Info command implementation.

/// Run the info command.
pub fn run() {
    println!("LLaMA decoder engine");
    println!("====================");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Build info:");
    println!("  Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));

    #[cfg(feature = "cuda")]
    println!("  CUDA: enabled");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA: disabled");

    #[cfg(feature = "metal")]
    println!("  Metal: enabled");
    #[cfg(not(feature = "metal"))]
    println!("  Metal: disabled");

    println!();
    println!("Crates:");
    println!("  llama-core: Errors, configuration and shared types");
    println!("  llama-model: Decoder, LoRA attention, KV cache, prefix priming, sampling");
    println!("  text-tokenizer: HuggingFace tokenizer wrapper");
    println!("  runtime: Logging, device selection, text pipeline");
    println!("  llama-cli: This CLI tool");
}
