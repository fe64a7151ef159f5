//! FLUX.1-schnell noise-prediction transformer for Burn
//!
//! One call to [`FluxTransformer::predict`] is one denoising step: it takes
//! packed latent tokens, the T5 sequence and pooled CLIP embeddings and a
//! schedule index, and returns the noise residual for those latents.
//!
//! # Example
//!
//! ```ignore
//! use burn_flux_dit::{load_flux, FluxConfig, SampleConfig};
//!
//! let model = load_flux::<B, _>("transformer.safetensors", &FluxConfig::flux_schnell(), &device)?;
//! let config = SampleConfig::new(4);
//! for t in 0..config.num_inference_steps {
//!     let noise = model.predict(t, prompt_embeds.clone(), pooled.clone(), latents.clone(), &config)?;
//!     // scheduler update
//! }
//! ```

pub mod blocks;
pub mod embed;
pub mod error;
pub mod flux;
pub mod flux_loader;
pub mod schedule;

pub use error::{ErrorKind, FluxError};
pub use flux::{FluxConfig, FluxTransformer};
pub use flux_loader::load_flux;
pub use schedule::SampleConfig;
