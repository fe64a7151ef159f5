//! Host-side numeric diagnostics
//!
//! These pull the tensor back to the host, so they are meant for opt-in
//! checks and debug logging, not for every forward pass.

use burn::prelude::*;

/// Counts of non-finite values in a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FiniteReport {
    /// Number of NaN values
    pub nan: usize,
    /// Number of +/-Inf values
    pub inf: usize,
    /// Total number of values
    pub total: usize,
}

impl FiniteReport {
    /// True when no NaN or Inf was found
    pub fn is_finite(&self) -> bool {
        self.nan == 0 && self.inf == 0
    }
}

/// Scans a tensor for NaN/Inf values
pub fn finite_report<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> FiniteReport {
    let data = tensor.clone().into_data();

    data.iter::<f32>().fold(FiniteReport::default(), |mut report, x| {
        report.total += 1;
        if x.is_nan() {
            report.nan += 1;
        } else if x.is_infinite() {
            report.inf += 1;
        }
        report
    })
}

/// One-line summary (min/max/mean/std and non-finite counts) for logging
pub fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats: Vec<f32> = tensor.clone().into_data().iter::<f32>().collect();

    if floats.is_empty() {
        return "empty".to_string();
    }

    let finite: Vec<f32> = floats.iter().copied().filter(|x| x.is_finite()).collect();
    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();

    if finite.is_empty() {
        return format!("no finite values [NaN={nan_count}, Inf={inf_count}]");
    }

    let min = finite.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = finite.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = finite.iter().sum::<f32>() / finite.len() as f32;
    let var = finite.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / finite.len() as f32;
    let std = var.sqrt();

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={min:.4}, max={max:.4}, mean={mean:.4}, std={std:.4} [NaN={nan_count}, Inf={inf_count}]"
        )
    } else {
        format!("min={min:.4}, max={max:.4}, mean={mean:.4}, std={std:.4}")
    }
}
