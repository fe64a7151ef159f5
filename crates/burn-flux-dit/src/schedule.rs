//! Sampling configuration and the time schedule

use burn_flux_core::attention::AttentionStrategy;

use crate::error::FluxError;

/// Pixels per latent token side (VAE downsampling x 2x2 packing)
pub const PIXELS_PER_TOKEN: usize = 16;

/// Per-run settings consumed by `predict`
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConfig {
    /// Number of denoising steps
    pub num_inference_steps: usize,
    /// Continuous time values, `num_inference_steps + 1` of them, from 1 down to 0
    pub time_steps: Vec<f32>,
    /// Output width in pixels
    pub width: usize,
    /// Output height in pixels
    pub height: usize,
    /// Check intermediates for NaN/Inf
    pub check_finite: bool,
    /// Attention execution strategy
    pub attention: AttentionStrategy,
}

impl SampleConfig {
    /// Schedule of `num_inference_steps` steps at 1024x1024
    pub fn new(num_inference_steps: usize) -> Self {
        Self {
            num_inference_steps,
            time_steps: linspace(1.0, 0.0, num_inference_steps + 1),
            width: 1024,
            height: 1024,
            check_finite: false,
            attention: AttentionStrategy::default(),
        }
    }

    pub fn with_size(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_finite_checks(mut self, enabled: bool) -> Self {
        self.check_finite = enabled;
        self
    }

    pub fn with_attention(mut self, strategy: AttentionStrategy) -> Self {
        self.attention = strategy;
        self
    }

    /// Look up the continuous time for step index `t`
    pub fn time_step(&self, t: usize) -> Result<f32, FluxError> {
        self.time_steps
            .get(t)
            .copied()
            .ok_or(FluxError::TimestepOutOfRange {
                index: t,
                len: self.time_steps.len(),
            })
    }

    /// Latent token grid as (rows, cols)
    pub fn latent_grid(&self) -> Result<(usize, usize), FluxError> {
        if self.width == 0
            || self.height == 0
            || self.width % PIXELS_PER_TOKEN != 0
            || self.height % PIXELS_PER_TOKEN != 0
        {
            return Err(FluxError::Configuration(format!(
                "image size {}x{} must be a positive multiple of {PIXELS_PER_TOKEN}",
                self.width, self.height
            )));
        }
        Ok((self.height / PIXELS_PER_TOKEN, self.width / PIXELS_PER_TOKEN))
    }

    /// Number of image tokens
    pub fn image_tokens(&self) -> Result<usize, FluxError> {
        let (rows, cols) = self.latent_grid()?;
        Ok(rows * cols)
    }
}

impl Default for SampleConfig {
    /// Schnell's usual 4-step schedule
    fn default() -> Self {
        Self::new(4)
    }
}

/// `n` evenly spaced values from `start` to `end`, both included
pub fn linspace(start: f32, end: f32, n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f32;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f32 })
                .collect()
        }
    }
}
