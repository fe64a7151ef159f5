//! Name-addressed weight sources and strict binding
//!
//! A [`TensorSource`] is anything that can hand out f32 values by name: a
//! memory-mapped [`SafeTensorFile`] or an in-memory [`WeightMap`]. The
//! [`WeightBinder`] pulls tensors out of a source with shape checks and
//! remembers every name it consumed, so leftovers can be reported once a
//! model has been fully bound.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use burn::module::Param;
use burn::nn::Linear;
use burn::prelude::*;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

use crate::loader::{check_len, LoadError, SafeTensorFile};

/// Read access to named f32 tensors
pub trait TensorSource {
    /// All tensor names in the source
    fn tensor_names(&self) -> Vec<String>;

    /// Shape of a tensor, if present
    fn tensor_shape(&self, name: &str) -> Option<Vec<usize>>;

    /// Values of a tensor as row-major f32
    fn read_tensor(&self, name: &str) -> Result<Vec<f32>, LoadError>;
}

impl TensorSource for SafeTensorFile {
    fn tensor_names(&self) -> Vec<String> {
        self.names().map(str::to_string).collect()
    }

    fn tensor_shape(&self, name: &str) -> Option<Vec<usize>> {
        self.shape(name).map(<[usize]>::to_vec)
    }

    fn read_tensor(&self, name: &str) -> Result<Vec<f32>, LoadError> {
        self.read_f32(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// In-memory name -> f32 tensor mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightMap {
    tensors: BTreeMap<String, StoredTensor>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every tensor of another source into memory
    pub fn from_source<S: TensorSource + ?Sized>(source: &S) -> Result<Self, LoadError> {
        let mut map = Self::new();
        for name in source.tensor_names() {
            let shape = source
                .tensor_shape(&name)
                .ok_or_else(|| LoadError::TensorNotFound(name.clone()))?;
            let data = source.read_tensor(&name)?;
            map.insert(name, shape, data)?;
        }
        Ok(map)
    }

    /// Insert raw values; the value count must match the shape
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<(), LoadError> {
        let name = name.into();
        check_len(&name, &shape, data.len())?;
        self.tensors.insert(name, StoredTensor { shape, data });
        Ok(())
    }

    /// Insert a burn tensor, copying it to the host
    pub fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        name: impl Into<String>,
        tensor: Tensor<B, D>,
    ) -> Result<(), LoadError> {
        let name = name.into();
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.into_data().iter::<f32>().collect();
        self.insert(name, shape, data)
    }

    /// Insert a linear layer in `[out, in]` layout under `{prefix}.weight` / `{prefix}.bias`
    pub fn insert_linear<B: Backend>(
        &mut self,
        prefix: &str,
        linear: &Linear<B>,
    ) -> Result<(), LoadError> {
        self.insert_tensor(format!("{prefix}.weight"), linear.weight.val().transpose())?;
        if let Some(bias) = &linear.bias {
            self.insert_tensor(format!("{prefix}.bias"), bias.val())?;
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<(Vec<usize>, Vec<f32>)> {
        self.tensors.remove(name).map(|t| (t.shape, t.data))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Load a tensor onto a device
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let stored = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        let shape: [usize; D] =
            stored
                .shape
                .as_slice()
                .try_into()
                .map_err(|_| LoadError::RankMismatch {
                    name: name.to_string(),
                    expected: D,
                    actual: stored.shape.clone(),
                })?;

        Ok(Tensor::from_data(
            TensorData::new(stored.data.clone(), shape),
            device,
        ))
    }

    /// Serialize to safetensors bytes (all tensors stored as F32)
    pub fn to_safetensors(&self) -> Result<Vec<u8>, LoadError> {
        let bytes: Vec<(&str, &[usize], Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let raw = t.data.iter().flat_map(|x| x.to_le_bytes()).collect();
                (name.as_str(), t.shape.as_slice(), raw)
            })
            .collect();

        let views = bytes
            .iter()
            .map(|(name, shape, raw)| {
                TensorView::new(Dtype::F32, shape.to_vec(), raw).map(|view| (*name, view))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(safetensors::serialize(views, &None)?)
    }

    /// Write to a safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LoadError> {
        std::fs::write(path, self.to_safetensors()?)?;
        Ok(())
    }
}

impl TensorSource for WeightMap {
    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    fn tensor_shape(&self, name: &str) -> Option<Vec<usize>> {
        self.tensors.get(name).map(|t| t.shape.clone())
    }

    fn read_tensor(&self, name: &str) -> Result<Vec<f32>, LoadError> {
        self.tensors
            .get(name)
            .map(|t| t.data.clone())
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))
    }
}

/// Shape-checked binding that tracks which names were consumed
pub struct WeightBinder<'a, S: TensorSource + ?Sized> {
    source: &'a S,
    consumed: BTreeSet<String>,
}

impl<'a, S: TensorSource + ?Sized> WeightBinder<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            consumed: BTreeSet::new(),
        }
    }

    /// Load a tensor whose stored shape must equal `expected`
    pub fn tensor<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let actual = self
            .source
            .tensor_shape(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;

        if actual.as_slice() != expected.as_slice() {
            return Err(LoadError::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual,
            });
        }

        let data = self.source.read_tensor(name)?;
        check_len(name, &actual, data.len())?;
        self.consumed.insert(name.to_string());

        Ok(Tensor::from_data(TensorData::new(data, expected), device))
    }

    /// Bind a biased linear layer stored as `[out, in]` weight plus `[out]` bias
    pub fn linear<B: Backend>(
        &mut self,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        device: &B::Device,
    ) -> Result<Linear<B>, LoadError> {
        let weight: Tensor<B, 2> =
            self.tensor(&format!("{prefix}.weight"), [out_features, in_features], device)?;
        let bias: Tensor<B, 1> = self.tensor(&format!("{prefix}.bias"), [out_features], device)?;

        // burn keeps linear weights as [in, out]
        Ok(Linear {
            weight: Param::from_tensor(weight.transpose()),
            bias: Some(Param::from_tensor(bias)),
        })
    }

    /// Number of names consumed so far
    pub fn consumed(&self) -> usize {
        self.consumed.len()
    }

    /// Names in the source that were never consumed, sorted
    pub fn unconsumed(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .source
            .tensor_names()
            .into_iter()
            .filter(|name| !self.consumed.contains(name))
            .collect();
        names.sort();
        names
    }

    /// Finish binding, failing if any source tensor was left unused
    pub fn finish(self) -> Result<usize, LoadError> {
        let leftover = self.unconsumed();
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), first = %leftover[0], "unexpected tensors in weight source");
            return Err(LoadError::UnexpectedTensors(leftover));
        }
        tracing::debug!(tensors = self.consumed.len(), "weight binding complete");
        Ok(self.consumed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::LinearConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_insert_rejects_wrong_length() {
        let mut map = WeightMap::new();
        assert!(map.insert("x", vec![2, 2], vec![1.0; 3]).is_err());
        assert!(map.insert("x", vec![2, 2], vec![1.0; 4]).is_ok());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_tensor_loads_with_rank_check() {
        let device = Default::default();
        let mut map = WeightMap::new();
        map.insert("scale", vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();

        let scale: Tensor<TestBackend, 2> = map.tensor("scale", &device).unwrap();
        assert_eq!(scale.dims(), [2, 2]);
        assert_eq!(scale.into_data().iter::<f32>().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);

        match map.tensor::<TestBackend, 1>("scale", &device) {
            Err(LoadError::RankMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 1);
                assert_eq!(actual, vec![2, 2]);
            }
            other => panic!("expected rank mismatch, got {other:?}"),
        }
        assert!(matches!(
            map.tensor::<TestBackend, 2>("missing", &device),
            Err(LoadError::TensorNotFound(_))
        ));
    }

    #[test]
    fn test_insert_linear_roundtrips_through_binder() {
        let device = Default::default();
        let linear: Linear<TestBackend> = LinearConfig::new(3, 5).init(&device);

        let mut map = WeightMap::new();
        map.insert_linear("proj", &linear).unwrap();
        assert_eq!(map.tensor_shape("proj.weight"), Some(vec![5, 3]));

        let mut binder = WeightBinder::new(&map);
        let bound: Linear<TestBackend> = binder.linear("proj", 3, 5, &device).unwrap();
        assert_eq!(binder.finish().unwrap(), 2);

        let x: Tensor<TestBackend, 2> = Tensor::random(
            [4, 3],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let diff = (linear.forward(x.clone()) - bound.forward(x))
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_binder_shape_mismatch_names_tensor() {
        let device = Default::default();
        let mut map = WeightMap::new();
        map.insert("w", vec![2, 3], vec![0.0; 6]).unwrap();

        let mut binder = WeightBinder::new(&map);
        let err = binder.tensor::<TestBackend, 2>("w", [3, 2], &device).unwrap_err();
        match err {
            LoadError::ShapeMismatch { name, expected, actual } => {
                assert_eq!(name, "w");
                assert_eq!(expected, vec![3, 2]);
                assert_eq!(actual, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_binder_reports_leftovers() {
        let device = Default::default();
        let mut map = WeightMap::new();
        map.insert("used", vec![1], vec![0.0]).unwrap();
        map.insert("zeta", vec![1], vec![0.0]).unwrap();
        map.insert("alpha", vec![1], vec![0.0]).unwrap();

        let mut binder = WeightBinder::new(&map);
        binder.tensor::<TestBackend, 1>("used", [1], &device).unwrap();
        assert_eq!(binder.consumed(), 1);

        match binder.finish() {
            Err(LoadError::UnexpectedTensors(names)) => assert_eq!(names, vec!["alpha", "zeta"]),
            other => panic!("expected UnexpectedTensors, got {other:?}"),
        }
    }
}
