//! Load tensors from .safetensors files

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype {dtype:?} for tensor {name}")]
    UnsupportedDtype { name: String, dtype: Dtype },

    #[error("Rank mismatch for {name}: expected rank {expected}, got shape {actual:?}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: Vec<usize>,
    },

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Invalid data for {name}: {reason}")]
    InvalidData { name: String, reason: String },

    #[error("{} unexpected tensor(s) in source, first: {}", .0.len(), .0.first().map(String::as_str).unwrap_or(""))]
    UnexpectedTensors(Vec<String>),
}

/// A safetensors file with memory-mapped data
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    /// Open a safetensors file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // Safety: the map is read-only and owned by the returned value
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors = {
            let st = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;

            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect::<HashMap<_, _>>()
        };

        tracing::debug!(path = %path.display(), tensors = tensors.len(), "opened safetensors file");

        Ok(Self { mmap, tensors })
    }

    /// Number of tensors in the file
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// List all tensor names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(|s| s.as_str())
    }

    /// Check if a tensor exists
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get tensor shape
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    /// Get tensor dtype
    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// Read a tensor's values as f32, widening fp16/bf16
    pub fn read_f32(&self, name: &str) -> Result<Vec<f32>, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let floats = decode_f32(name, info.dtype, &self.mmap[info.start..info.end])?;
        check_len(name, &info.shape, floats.len())?;

        Ok(floats)
    }

    /// Load a tensor as f32, converting from fp16/bf16 if needed
    pub fn load_f32<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let shape = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] = shape.try_into().map_err(|_| LoadError::RankMismatch {
            name: name.to_string(),
            expected: D,
            actual: shape.to_vec(),
        })?;

        let floats = self.read_f32(name)?;
        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Load a tensor with expected shape, converting to f32
    pub fn load_f32_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected_shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if actual != expected_shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                actual: actual.to_vec(),
            });
        }

        self.load_f32::<B, D>(name, device)
    }
}

/// Decode little-endian tensor bytes into f32 values
///
/// Reads byte-wise so unaligned mmap data is fine.
pub fn decode_f32(name: &str, dtype: Dtype, data: &[u8]) -> Result<Vec<f32>, LoadError> {
    let width = match dtype {
        Dtype::F32 => 4,
        Dtype::F16 | Dtype::BF16 => 2,
        dtype => {
            return Err(LoadError::UnsupportedDtype {
                name: name.to_string(),
                dtype,
            })
        }
    };

    if data.len() % width != 0 {
        return Err(LoadError::InvalidData {
            name: name.to_string(),
            reason: format!("{} bytes is not a multiple of {width}", data.len()),
        });
    }

    let floats = match dtype {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        _ => data
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
    };

    Ok(floats)
}

pub(crate) fn check_len(name: &str, shape: &[usize], len: usize) -> Result<(), LoadError> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(LoadError::InvalidData {
            name: name.to_string(),
            reason: format!("shape {shape:?} needs {expected} values, found {len}"),
        });
    }
    Ok(())
}
