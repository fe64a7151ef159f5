//! Weight loading for burn-flux
//!
//! Reads safetensors checkpoints and binds them into burn modules with
//! name and shape checks.
//!
//! ```ignore
//! use burn_flux_convert::{SafeTensorFile, WeightBinder};
//!
//! let file = SafeTensorFile::open("transformer.safetensors")?;
//! let mut binder = WeightBinder::new(&file);
//! let proj = binder.linear::<B>("proj_out", 3072, 64, &device)?;
//! binder.finish()?; // fails if the file holds tensors nobody asked for
//! ```

pub mod loader;
pub mod weights;

pub use loader::{LoadError, SafeTensorFile};
pub use weights::{TensorSource, WeightBinder, WeightMap};
