//! Core building blocks for the FLUX diffusion transformer
//!
//! Shared components used by the dual-stream and single-stream blocks in
//! `burn-flux-dit`.
//!
//! # Modules
//!
//! ## Attention
//!
//! - [`attention`] - Scaled dot-product attention with chunked execution strategies
//! - [`rope`] - Multi-axis rotary position embeddings and position-id builders
//!
//! ## Normalization
//!
//! - [`layernorm`] - Parameter-free layer normalization
//! - [`rmsnorm`] - RMS normalization (per-head QK-norm)
//! - [`dit`] - Adaptive layer norms (AdaLN-Zero, continuous AdaLN) and latent packing
//!
//! ## Feed-Forward
//!
//! - [`mlp`] - GELU(tanh) MLP
//!
//! ## Diagnostics
//!
//! - [`numeric`] - NaN/Inf detection and tensor statistics
//!
//! # Example
//!
//! ```ignore
//! use burn_flux_core::rope::{image_position_ids, joint_position_ids, text_position_ids, RotaryEmbedding};
//!
//! let ids = joint_position_ids(
//!     text_position_ids(1, 256, &device),
//!     image_position_ids(1, 64, 64, &device),
//! );
//! let rope = RotaryEmbedding::from_position_ids(ids, &[16, 56, 56], 10_000.0);
//! let (q_rot, k_rot) = rope.forward(q, k);
//! ```

pub mod attention;
pub mod dit;
pub mod layernorm;
pub mod mlp;
pub mod numeric;
pub mod rmsnorm;
pub mod rope;
