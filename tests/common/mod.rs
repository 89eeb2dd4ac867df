#![allow(dead_code)]

use std::path::{Path, PathBuf};
use ndarray::{Array3, ArrayD, IxDyn};
use ppg_onnx::config::ModelArchitecture;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

/// Deterministic, non-trivial parameter values.
pub fn parameter_values(seed: usize, len: usize) -> Vec<f32> {
    (0..len).map(|i| (((seed * 7919 + i) as f32) * 0.37).sin() * 0.1).collect()
}

pub fn write_safetensors_with_dtype(path: &Path, tensors: &[(String, Vec<usize>)], dtype: Dtype) {
    let buffers: Vec<Vec<u8>> = tensors.iter().enumerate().map(|(seed, (_, shape))| {
        let values = parameter_values(seed, shape.iter().product());
        match dtype {
            Dtype::F32 => values.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Dtype::F16 => values.iter().flat_map(|x| half::f16::from_f32(*x).to_le_bytes()).collect(),
            Dtype::BF16 => values.iter().flat_map(|x| half::bf16::from_f32(*x).to_le_bytes()).collect(),
            other => panic!("unsupported fixture dtype {:?}", other),
        }
    }).collect();
    let views: Vec<(&str, TensorView)> = tensors.iter().zip(&buffers)
        .map(|((name, shape), data)| (name.as_str(), TensorView::new(dtype, shape.clone(), data).unwrap()))
        .collect();
    let bytes = safetensors::serialize(views, &None).unwrap();
    std::fs::write(path, bytes).unwrap();
}

pub fn write_safetensors(path: &Path, tensors: &[(String, Vec<usize>)]) {
    write_safetensors_with_dtype(path, tensors, Dtype::F32)
}

/// A checkpoint matching `architecture` exactly.
pub fn write_checkpoint(dir: &Path, architecture: &ModelArchitecture) -> PathBuf {
    let path = dir.join("ppg.safetensors");
    write_safetensors(&path, &architecture.parameter_shapes());
    path
}

pub fn signal(batch: usize, channels: usize, length: usize) -> Array3<f32> {
    Array3::from_shape_fn((batch, channels, length), |(b, c, t)| ((b * 31 + c * 7 + t) as f32 * 0.05).cos())
}

pub fn signal_dyn(batch: usize, channels: usize, length: usize) -> ArrayD<f32> {
    let signal = signal(batch, channels, length);
    ArrayD::from_shape_vec(IxDyn(&[batch, channels, length]), signal.iter().copied().collect()).unwrap()
}
