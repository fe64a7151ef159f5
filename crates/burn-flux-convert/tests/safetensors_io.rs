//! Round-trips weight maps through real safetensors files

use std::path::PathBuf;

use burn::prelude::*;
use burn_flux_convert::{LoadError, SafeTensorFile, TensorSource, WeightBinder, WeightMap};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("burn-flux-convert-{tag}-{}.safetensors", std::process::id()))
}

fn sample_map() -> WeightMap {
    let mut map = WeightMap::new();
    map.insert("block.weight", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        .unwrap();
    map.insert("block.bias", vec![2], vec![-0.5, 0.5]).unwrap();
    map
}

#[test]
fn test_save_and_open() {
    let path = temp_path("open");
    let map = sample_map();
    map.save(&path).unwrap();

    let file = SafeTensorFile::open(&path).unwrap();
    assert_eq!(file.len(), 2);
    assert!(file.contains("block.weight"));
    assert!(!file.contains("block.scale"));
    assert_eq!(file.shape("block.weight"), Some(&[2usize, 3][..]));
    assert_eq!(file.dtype("block.bias"), Some(safetensors::Dtype::F32));

    let device = Default::default();
    let weight: Tensor<TestBackend, 2> = file.load_f32_checked("block.weight", [2, 3], &device).unwrap();
    let values: Vec<f32> = weight.into_data().iter::<f32>().collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    let reloaded = WeightMap::from_source(&file).unwrap();
    assert_eq!(reloaded, map);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_file_errors() {
    let path = temp_path("errors");
    sample_map().save(&path).unwrap();
    let file = SafeTensorFile::open(&path).unwrap();
    let device = Default::default();

    assert!(matches!(
        file.load_f32::<TestBackend, 2>("missing", &device),
        Err(LoadError::TensorNotFound(_))
    ));
    assert!(matches!(
        file.load_f32::<TestBackend, 3>("block.weight", &device),
        Err(LoadError::RankMismatch { expected: 3, .. })
    ));
    assert!(matches!(
        file.load_f32_checked::<TestBackend, 2>("block.weight", [3, 2], &device),
        Err(LoadError::ShapeMismatch { .. })
    ));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_binder_over_file() {
    let path = temp_path("binder");
    sample_map().save(&path).unwrap();
    let file = SafeTensorFile::open(&path).unwrap();
    let device = Default::default();

    let mut binder = WeightBinder::new(&file);
    let linear = binder.linear::<TestBackend>("block", 3, 2, &device).unwrap();
    assert_eq!(binder.finish().unwrap(), 2);

    // [in, out] after binding
    assert_eq!(linear.weight.val().dims(), [3, 2]);
    let x: Tensor<TestBackend, 2> = Tensor::from_floats([[1.0, 0.0, 0.0]], &device);
    let y: Vec<f32> = linear.forward(x).into_data().iter::<f32>().collect();
    assert_eq!(y, vec![0.5, 4.5]);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_open_missing_file() {
    let result = SafeTensorFile::open(temp_path("does-not-exist"));
    assert!(matches!(result, Err(LoadError::Io(_))));
}

#[test]
fn test_names_sorted_in_map() {
    let map = sample_map();
    assert_eq!(map.tensor_names(), vec!["block.bias", "block.weight"]);
}
