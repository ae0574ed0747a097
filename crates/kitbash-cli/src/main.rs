//! Command-line host for kitbash merges.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kitbash_merge::{
    save_safetensors, CalcModeRegistry, Dtype, MergeRequest, Merger, MergerConfig, PriorMergeStore,
    SafetensorsStore, TensorStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "kitbash")]
#[command(author, version, about = "Per-key checkpoint merging with structural memoization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available calc modes and their parameters
    Modes,

    /// Merge checkpoints according to a request file
    Merge {
        /// Directory holding the checkpoints named in the request
        #[arg(short, long)]
        models: PathBuf,

        /// Merge request (YAML)
        #[arg(short, long)]
        request: PathBuf,

        /// Merger settings (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output safetensors file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker threads (0 = twice the available parallelism)
        #[arg(long)]
        threads: Option<usize>,

        /// Working precision (f32, f16, bf16)
        #[arg(long)]
        dtype: Option<Dtype>,

        /// Result cache budget in MiB
        #[arg(long)]
        cache_size_mib: Option<usize>,

        /// Run the merge this many times, reusing the previous result
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Modes => list_modes(),
        Commands::Merge {
            models,
            request,
            config,
            output,
            threads,
            dtype,
            cache_size_mib,
            repeat,
        } => {
            let mut merger_config = match config {
                Some(path) => MergerConfig::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load config {:?}", path))?,
                None => MergerConfig::default(),
            };
            if let Some(threads) = threads {
                merger_config.threads = threads;
            }
            if let Some(dtype) = dtype {
                merger_config.dtype = dtype;
            }
            if let Some(mib) = cache_size_mib {
                merger_config.cache_size_mib = mib;
            }

            let request = MergeRequest::from_yaml_file(&request)
                .with_context(|| format!("Failed to load request {:?}", request))?;
            run_merge(merger_config, &request, &models, output.as_deref(), repeat.max(1))
        }
    }
}

fn list_modes() -> anyhow::Result<()> {
    let registry = CalcModeRegistry::with_builtin();
    for mode in registry.iter() {
        println!("{} ({} models)", mode.name(), mode.input_models());
        println!("    {}", mode.description());
        for slider in mode.sliders() {
            println!(
                "    {:<6} {:<28} [{}, {}] step {}",
                slider.param.as_str(),
                slider.label,
                slider.min,
                slider.max,
                slider.step
            );
        }
    }
    Ok(())
}

fn run_merge(
    config: MergerConfig,
    request: &MergeRequest,
    models: &Path,
    output: Option<&Path>,
    repeat: usize,
) -> anyhow::Result<()> {
    println!("========================================");
    println!("  Kitbash Merge");
    println!("========================================");
    println!("Calc mode:  {}", request.calc_mode);
    for (slot, name) in ["A", "B", "C", "D"].iter().zip(&request.checkpoints) {
        println!("Model {}:    {}", slot, name);
    }
    println!("Targets:    {}", request.targets.len());
    println!("Dtype:      {}", config.dtype);
    if let Some(output) = output {
        println!("Output:     {:?}", output);
    }
    println!("========================================\n");

    let store = SafetensorsStore::new(models);
    let merger = Merger::new(config);
    let mut prior = PriorMergeStore::new();

    let mut last = None;
    for run in 1..=repeat {
        let outcome = merger.merge(request, &store, prior.get())?;
        let stats = &outcome.stats;
        info!(
            "Run {}/{}: {} evaluated, {} reused, {} fallbacks, cache hit rate {:.1}%",
            run,
            repeat,
            stats.evaluated,
            stats.reused,
            stats.fallbacks,
            stats.cache.hit_rate() * 100.0
        );
        prior.record(&outcome);
        last = Some(outcome);
    }
    let Some(outcome) = last else {
        return Ok(());
    };

    let stats = &outcome.stats;
    println!("\n========================================");
    println!("  Merged {} tensors in {:.2?}", outcome.tensors.len(), stats.elapsed);
    println!("========================================");
    println!("Evaluated:   {}", stats.evaluated);
    println!("Reused:      {}", stats.reused);
    println!("Passthrough: {}", stats.passthrough);
    println!("Fallbacks:   {}", stats.fallbacks);
    println!(
        "Cache:       {} hits, {} misses, {} evictions, {} of {} bytes",
        stats.cache.hits,
        stats.cache.misses,
        stats.cache.evictions,
        merger.cache().footprint(),
        merger.cache().capacity()
    );

    if let Some(output) = output {
        let primary = request.checkpoints().primary().clone();
        let order = store.open(&[primary.clone()])?.keys(&primary)?;
        save_safetensors(output, &order, &outcome.tensors)
            .with_context(|| format!("Failed to write {:?}", output))?;
        println!("Saved to {:?}", output);
    }
    Ok(())
}
