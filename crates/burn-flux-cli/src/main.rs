//! burn-flux CLI
//!
//! Tools around the FLUX.1-schnell transformer:
//! - inspect safetensors checkpoints
//! - validate that a checkpoint binds to the model
//! - run a single noise prediction from tensors on disk
//! - convert a decoded image tensor to PNG
//!
//! Set `RUST_LOG=debug` for per-block spans and timings.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use burn_flux_convert::{SafeTensorFile, WeightMap};
use burn_flux_core::attention::AttentionStrategy;
use burn_flux_dit::{load_flux, FluxConfig, SampleConfig};

/// Compute device for inference
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Default)]
pub enum Device {
    /// Best available (WGPU > CPU)
    #[default]
    Auto,
    /// WebGPU (Vulkan/Metal/DX12)
    #[cfg(feature = "wgpu")]
    Wgpu,
    /// CPU (ndarray backend)
    #[cfg(feature = "ndarray")]
    Cpu,
}

/// Model size preset
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Preset {
    /// FLUX.1-schnell (3072 hidden, 19 + 38 blocks)
    #[default]
    Schnell,
    /// Toy widths for smoke tests
    Tiny,
}

impl Preset {
    fn config(self) -> FluxConfig {
        match self {
            Preset::Schnell => FluxConfig::flux_schnell(),
            Preset::Tiny => FluxConfig::tiny(),
        }
    }
}

/// Attention execution strategy
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Attention {
    /// Full score matrix
    #[default]
    Standard,
    /// Queries in chunks of `--attention-chunk`
    QueryChunked,
    /// Heads in slices of `--attention-chunk`
    HeadSliced,
}

impl Attention {
    fn strategy(self, chunk: usize) -> AttentionStrategy {
        match self {
            Attention::Standard => AttentionStrategy::Standard,
            Attention::QueryChunked => AttentionStrategy::QueryChunked(chunk),
            Attention::HeadSliced => AttentionStrategy::HeadSliced(chunk),
        }
    }
}

#[derive(Parser)]
#[command(name = "burn-flux")]
#[command(about = "FLUX.1-schnell transformer tools in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tensors in a safetensors file
    Inspect {
        /// Path to safetensors file
        path: PathBuf,

        /// Filter tensor names (substring match)
        #[arg(short, long)]
        filter: Option<String>,

        /// Show only shapes, not dtypes
        #[arg(long)]
        shapes_only: bool,
    },

    /// Bind a transformer checkpoint and report its size
    Validate {
        /// Path to the transformer safetensors file
        weights: PathBuf,

        #[arg(long, value_enum, default_value_t = Preset::Schnell)]
        preset: Preset,

        #[arg(long, value_enum, default_value_t = Device::Auto)]
        device: Device,
    },

    /// Run one noise prediction
    Predict {
        /// Path to the transformer safetensors file
        #[arg(long)]
        weights: PathBuf,

        /// Safetensors file with `prompt_embeds`, `pooled_prompt_embeds` and `hidden_states`
        #[arg(long)]
        inputs: PathBuf,

        /// Where to write `noise_pred`
        #[arg(short, long)]
        output: PathBuf,

        /// Schedule index
        #[arg(short, long, default_value_t = 0)]
        t: usize,

        /// Number of inference steps in the schedule
        #[arg(long, default_value_t = 4)]
        steps: usize,

        /// Image width in pixels
        #[arg(long, default_value_t = 1024)]
        width: usize,

        /// Image height in pixels
        #[arg(long, default_value_t = 1024)]
        height: usize,

        #[arg(long, value_enum, default_value_t = Preset::Schnell)]
        preset: Preset,

        /// Fail on NaN/Inf in intermediates
        #[arg(long)]
        check_finite: bool,

        #[arg(long, value_enum, default_value_t = Attention::Standard)]
        attention: Attention,

        /// Chunk or slice size for the chunked attention strategies
        #[arg(long, default_value_t = 1024)]
        attention_chunk: usize,

        #[arg(long, value_enum, default_value_t = Device::Auto)]
        device: Device,
    },

    /// Convert a decoded image tensor `[batch, 3, h, w]` in [-1, 1] to PNG
    ToImage {
        /// Safetensors file holding the tensor
        #[arg(short, long)]
        input: PathBuf,

        /// Tensor name
        #[arg(long, default_value = "image")]
        name: String,

        /// Output image path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = Device::Auto)]
        device: Device,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            path,
            filter,
            shapes_only,
        } => run_inspect(&path, filter.as_deref(), shapes_only),

        Commands::Validate {
            weights,
            preset,
            device,
        } => run_job(
            Job::Validate {
                weights,
                config: preset.config(),
            },
            device,
        ),

        Commands::Predict {
            weights,
            inputs,
            output,
            t,
            steps,
            width,
            height,
            preset,
            check_finite,
            attention,
            attention_chunk,
            device,
        } => {
            let sample = SampleConfig::new(steps)
                .with_size(width, height)
                .with_finite_checks(check_finite)
                .with_attention(attention.strategy(attention_chunk));
            let job = Job::Predict {
                weights,
                inputs,
                output,
                t,
                config: preset.config(),
                sample,
            };
            run_job(job, device)
        }

        Commands::ToImage {
            input,
            name,
            output,
            device,
        } => run_job(Job::ToImage { input, name, output }, device),
    }
}

fn run_inspect(path: &Path, filter: Option<&str>, shapes_only: bool) -> Result<()> {
    let file = SafeTensorFile::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    let mut names: Vec<&str> = file.names().collect();
    names.sort_unstable();

    println!("File: {}", path.display());
    println!("Total tensors: {}\n", names.len());

    for name in names {
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }

        let shape = file.shape(name).unwrap_or_default();
        if shapes_only {
            println!("{name}: {shape:?}");
        } else if let Some(dtype) = file.dtype(name) {
            println!("{name}: {shape:?} ({dtype:?})");
        }
    }

    Ok(())
}

/// Commands that need a tensor backend
enum Job {
    Validate {
        weights: PathBuf,
        config: FluxConfig,
    },
    Predict {
        weights: PathBuf,
        inputs: PathBuf,
        output: PathBuf,
        t: usize,
        config: FluxConfig,
        sample: SampleConfig,
    },
    ToImage {
        input: PathBuf,
        name: String,
        output: PathBuf,
    },
}

impl Job {
    fn run<B: Backend>(self, device: &B::Device) -> Result<()> {
        match self {
            Job::Validate { weights, config } => run_validate::<B>(&weights, &config, device),
            Job::Predict {
                weights,
                inputs,
                output,
                t,
                config,
                sample,
            } => run_predict::<B>(&weights, &inputs, &output, t, &config, &sample, device),
            Job::ToImage { input, name, output } => run_to_image::<B>(&input, &name, &output, device),
        }
    }
}

/// Run a job on the requested backend
fn run_job(job: Job, device: Device) -> Result<()> {
    match resolve_device(device)? {
        #[cfg(feature = "wgpu")]
        Device::Wgpu => {
            use burn_wgpu::{Wgpu, WgpuDevice};
            type Backend = Wgpu<f32>;
            job.run::<Backend>(&WgpuDevice::default())
        }
        #[cfg(feature = "ndarray")]
        Device::Cpu => {
            use burn_ndarray::NdArray;
            type Backend = NdArray<f32>;
            job.run::<Backend>(&Default::default())
        }
        Device::Auto => bail!("Device was not resolved"),
    }
}

fn run_validate<B: Backend>(weights: &Path, config: &FluxConfig, device: &B::Device) -> Result<()> {
    let start = Instant::now();
    let model = load_flux::<B, _>(weights, config, device)
        .with_context(|| format!("Failed to bind {}", weights.display()))?;
    tracing::info!(elapsed = ?start.elapsed(), "weights bound");

    println!(
        "OK: {} dual-stream + {} single-stream blocks, {} parameters",
        model.transformer_blocks.len(),
        model.single_transformer_blocks.len(),
        model.num_params()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_predict<B: Backend>(
    weights: &Path,
    inputs: &Path,
    output: &Path,
    t: usize,
    config: &FluxConfig,
    sample: &SampleConfig,
    device: &B::Device,
) -> Result<()> {
    let start = Instant::now();
    let model = load_flux::<B, _>(weights, config, device)
        .with_context(|| format!("Failed to bind {}", weights.display()))?;
    tracing::info!(elapsed = ?start.elapsed(), "weights bound");

    let file = SafeTensorFile::open(inputs).with_context(|| format!("Failed to open {}", inputs.display()))?;
    let prompt_embeds: Tensor<B, 3> = file.load_f32("prompt_embeds", device)?;
    let pooled: Tensor<B, 2> = file.load_f32("pooled_prompt_embeds", device)?;
    let hidden_states: Tensor<B, 3> = file.load_f32("hidden_states", device)?;

    let start = Instant::now();
    let noise_pred = model.predict(t, prompt_embeds, pooled, hidden_states, sample)?;
    tracing::info!(elapsed = ?start.elapsed(), t, "prediction done");

    let dims = noise_pred.dims();
    let mut out = WeightMap::new();
    out.insert_tensor("noise_pred", noise_pred)?;
    out.save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Wrote noise_pred {dims:?} to {}", output.display());
    Ok(())
}

fn run_to_image<B: Backend>(input: &Path, name: &str, output: &Path, device: &B::Device) -> Result<()> {
    let file = SafeTensorFile::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    let decoded: Tensor<B, 4> = file
        .load_f32(name, device)
        .with_context(|| format!("Failed to read tensor {name}"))?;

    let image = burn_flux_image::to_image(decoded)?;
    image
        .save(output)
        .with_context(|| format!("Failed to save {}", output.display()))?;

    println!("Saved {}x{} image to {}", image.width(), image.height(), output.display());
    Ok(())
}

/// Try to initialize WGPU and return true if successful
#[cfg(feature = "wgpu")]
fn wgpu_available() -> bool {
    // WgpuDevice::default() may panic if no GPU is available
    std::panic::catch_unwind(|| {
        let _ = burn_wgpu::WgpuDevice::default();
    })
    .is_ok()
}

/// Resolve Auto device to a concrete device
fn resolve_device(requested: Device) -> Result<Device> {
    match requested {
        Device::Auto => {
            #[cfg(feature = "wgpu")]
            if wgpu_available() {
                tracing::info!("auto-detected WGPU");
                return Ok(Device::Wgpu);
            }
            #[cfg(feature = "ndarray")]
            {
                tracing::info!("using CPU");
                return Ok(Device::Cpu);
            }
            #[allow(unreachable_code)]
            {
                bail!("No backend available. Enable the 'wgpu' or 'ndarray' feature.")
            }
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_predict() {
        let cli = Cli::try_parse_from([
            "burn-flux",
            "predict",
            "--weights",
            "w.safetensors",
            "--inputs",
            "in.safetensors",
            "-o",
            "out.safetensors",
            "-t",
            "1",
            "--steps",
            "2",
            "--attention",
            "query-chunked",
            "--attention-chunk",
            "256",
        ])
        .unwrap();

        match cli.command {
            Commands::Predict {
                t,
                steps,
                attention,
                attention_chunk,
                ..
            } => {
                assert_eq!((t, steps), (1, 2));
                assert_eq!(attention.strategy(attention_chunk), AttentionStrategy::QueryChunked(256));
            }
            _ => panic!("expected predict"),
        }
    }

    #[test]
    fn test_parse_to_image_device() {
        let parse = |extra: &[&str]| {
            let args = ["burn-flux", "to-image", "-i", "decoded.safetensors", "-o", "out.png"];
            match Cli::try_parse_from(args.iter().chain(extra)).unwrap().command {
                Commands::ToImage { name, device, .. } => (name, device),
                _ => panic!("expected to-image"),
            }
        };

        assert_eq!(parse(&[]), ("image".to_string(), Device::Auto));
        #[cfg(feature = "ndarray")]
        assert_eq!(parse(&["--device", "cpu"]).1, Device::Cpu);
    }

    #[test]
    fn test_presets() {
        assert_eq!(Preset::Schnell.config(), FluxConfig::flux_schnell());
        assert_eq!(Preset::Tiny.config(), FluxConfig::tiny());
    }
}
