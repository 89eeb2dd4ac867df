use std::collections::BTreeMap;
use std::path::Path;
use onnx_graph::weights::{PthWeightManager, SafetensorsWeightManager, WeightManager};
use crate::config::ModelArchitecture;
use crate::{Error, StateDictMismatch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// `torch.save` zip archive with a pickled state dict.
    Pth,
    Safetensors
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|x| x.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("safetensors") => CheckpointFormat::Safetensors,
            _ => CheckpointFormat::Pth
        }
    }
}

pub enum Checkpoint {
    Pth(PthWeightManager),
    Safetensors(SafetensorsWeightManager)
}

impl Checkpoint {
    pub fn open(path: &Path, state_dict_key: Option<&str>) -> Result<Self, Error> {
        let checkpoint = match CheckpointFormat::from_path(path) {
            CheckpointFormat::Pth => Checkpoint::Pth(PthWeightManager::open(path, state_dict_key)?),
            CheckpointFormat::Safetensors => {
                if let Some(key) = state_dict_key {
                    log::warn!("Ignoring state dict key \"{}\" for safetensors checkpoint", key);
                }
                Checkpoint::Safetensors(SafetensorsWeightManager::open(path)?)
            }
        };
        log::debug!("Opened {:?} checkpoint {}", checkpoint.format(), path.display());
        checkpoint.weights().log_weight_list();
        Ok(checkpoint)
    }

    pub fn format(&self) -> CheckpointFormat {
        match self {
            Checkpoint::Pth(_) => CheckpointFormat::Pth,
            Checkpoint::Safetensors(_) => CheckpointFormat::Safetensors
        }
    }

    pub fn weights(&self) -> &dyn WeightManager {
        match self {
            Checkpoint::Pth(x) => x,
            Checkpoint::Safetensors(x) => x
        }
    }
}

/// Compares the checkpoint's keys and shapes against the architecture, the way a strict
/// `load_state_dict` does.
pub fn check_state_dict(architecture: &ModelArchitecture, weights: &dyn WeightManager) -> Result<(), Error> {
    let expected: BTreeMap<String, Vec<usize>> = architecture.parameter_shapes().into_iter().collect();
    let found = weights.get_tensor_names();

    let mut mismatch = StateDictMismatch::default();
    for name in expected.keys() {
        if !found.contains(name) {
            mismatch.missing.push(name.clone());
        }
    }
    for name in &found {
        match expected.get(name) {
            None => mismatch.unexpected.push(name.clone()),
            Some(expected_shape) => {
                let shape = weights.get_tensor_shape(name)?;
                if &shape != expected_shape {
                    mismatch.size_mismatch.push((name.clone(), shape, expected_shape.clone()));
                }
            }
        }
    }

    if mismatch.is_empty() {
        Ok(())
    } else {
        Err(Error::StateDictMismatch(mismatch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onnx_graph::tensor::{Shape, TensorData};
    use onnx_graph::weights::StateDictWeightManager;

    fn weights_for(shapes: &[(&str, Vec<usize>)]) -> StateDictWeightManager {
        let mut tensors = BTreeMap::new();
        for (name, shape) in shapes {
            tensors.insert(name.to_string(), TensorData::fill(Shape::from(shape.clone()), 0.0f32).unwrap());
        }
        StateDictWeightManager::new(tensors)
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(CheckpointFormat::from_path(Path::new("model.safetensors")), CheckpointFormat::Safetensors);
        assert_eq!(CheckpointFormat::from_path(Path::new("model.SafeTensors")), CheckpointFormat::Safetensors);
        assert_eq!(CheckpointFormat::from_path(Path::new("model.pth")), CheckpointFormat::Pth);
        assert_eq!(CheckpointFormat::from_path(Path::new("model.ckpt")), CheckpointFormat::Pth);
        assert_eq!(CheckpointFormat::from_path(Path::new("model")), CheckpointFormat::Pth);
    }

    #[test]
    fn exact_state_dict_passes() {
        let arch = ModelArchitecture::default();
        let shapes: Vec<_> = arch.parameter_shapes();
        let shapes: Vec<(&str, Vec<usize>)> = shapes.iter().map(|(n, s)| (n.as_str(), s.clone())).collect();
        check_state_dict(&arch, &weights_for(&shapes)).unwrap();
    }

    #[test]
    fn strict_check_reports_all_differences() {
        let weights = weights_for(&[
            ("conv.weight", vec![8, 1, 3]),
            ("conv.bias", vec![16]),
            ("fc.weight", vec![2, 1888]),
            ("num_batches_tracked", vec![1]),
        ]);
        let Err(Error::StateDictMismatch(mismatch)) = check_state_dict(&ModelArchitecture::default(), &weights) else {
            panic!("expected a state dict mismatch");
        };
        assert_eq!(mismatch.missing, vec!["fc.bias".to_string()]);
        assert_eq!(mismatch.unexpected, vec!["num_batches_tracked".to_string()]);
        assert_eq!(mismatch.size_mismatch, vec![("conv.weight".to_string(), vec![8, 1, 3], vec![16, 1, 3])]);
    }
}
