use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use memmap2::Mmap;
use safetensors::SafeTensors;
use safetensors::tensor::Metadata;
use crate::{onnx, Error};
use crate::onnx::TensorProto;
use crate::tensor::{Tensor, TensorData, WeightTensor};

pub trait WeightExternalOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: &'a TensorData) -> Result<(), Error>;
    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error>;
    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct EmbeddedOutputManager<'a> {
    tensor_data_map: HashMap<&'a dyn Tensor, &'a TensorData>,
}

impl<'a> EmbeddedOutputManager<'a> {
    pub fn new() -> Self {
        Self {
            tensor_data_map: HashMap::new(),
        }
    }
}

impl Default for EmbeddedOutputManager<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl <'a> WeightExternalOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, tensor_data: &'a TensorData) -> Result<(), Error> {
        self.tensor_data_map.insert(graph_tensor, tensor_data);
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some(tensor_data) = self.tensor_data_map.remove(&graph_tensor) {
            Ok(Some(tensor_data.to_tensor_data_proto(Some(tensor_name))?))
        }
        else {
            Ok(None)
        }
    }
}

/// Writes weights into a side file referenced through ONNX external data.
pub struct BinOutputManager<'a> {
    output: BufWriter<File>,
    output_path: PathBuf,
    bytes_written: usize,
    tensor_data_map: HashMap<&'a dyn Tensor, (usize, usize)>,
    output_data: Option<Vec<onnx::StringStringEntryProto>>
}

impl<'a> BinOutputManager<'a> {
    pub fn new(output_location: &Path) -> Result<Self, Error> {
        let output = BufWriter::new(File::create(output_location)?);
        Ok(Self {
            output,
            output_path: output_location.to_path_buf(),
            bytes_written: 0,
            tensor_data_map: HashMap::new(),
            output_data: None
        })
    }
}

impl<'a> WeightExternalOutputManager<'a> for BinOutputManager<'a> {
    fn write_tensor_data(&mut self, graph_tensor: &'a dyn Tensor, data: &'a TensorData) -> Result<(), Error> {
        let offset = self.bytes_written;
        let data = data.to_raw_encoding();
        self.output.write_all(&data)?;
        self.bytes_written += data.len();
        self.tensor_data_map.insert(graph_tensor, (offset, data.len()));
        Ok(())
    }

    fn get_initializer(&mut self, graph_tensor: &'a dyn Tensor, tensor_name: String) -> Result<Option<TensorProto>, Error> {
        if let Some((byte_offset, byte_len)) = self.tensor_data_map.remove(&graph_tensor) {
            let mut external_data = self.output_data.clone().ok_or(Error::WeightsNotFinalizedError)?;
            external_data.extend_from_slice(&[
                onnx::StringStringEntryProto {
                    key: "offset".to_string(),
                    value: format!("{byte_offset}"),
                },
                onnx::StringStringEntryProto {
                    key: "length".to_string(),
                    value: format!("{byte_len}"),
                }
            ]);
            Ok(Some(TensorProto {
                name: tensor_name,
                data_type: onnx::tensor_proto::DataType::from(graph_tensor.dtype()) as i32,
                dims: graph_tensor.shape().resolve()?.iter().map(|x| *x as i64).collect(),
                data_location: onnx::tensor_proto::DataLocation::External as i32,
                external_data,
                .. Default::default()
            }))
        }
        else {
            Ok(None)
        }
    }

    fn finalize_tensor_data(&mut self) -> Result<(), Error> {
        self.output.flush()?;
        let location = self.output_path.file_name()
            .and_then(|x| x.to_str())
            .ok_or_else(|| Error::InvalidPathError(self.output_path.clone()))?;
        self.output_data = Some(vec![
            onnx::StringStringEntryProto {
                key: "location".to_string(),
                value: location.to_string(),
            }
        ]);
        Ok(())
    }
}

fn join_prefix(prefix: Option<&str>, name: &str) -> String {
    if let Some(prefix) = prefix {
        format!("{}.{}", prefix, name)
    } else {
        name.to_string()
    }
}

/// Read access to a named parameter collection, scoped by dotted prefixes the way
/// PyTorch names submodule parameters (`conv.weight`, `fc.bias`).
pub trait WeightManager {
    fn prefix(&self, name: &str) -> Self where Self: Sized;
    fn get_prefix(&self) -> Option<&str>;
    /// Every tensor name in the collection, ignoring the current prefix, sorted.
    fn get_tensor_names(&self) -> Vec<String>;
    fn get_tensor_shape(&self, name: &str) -> Result<Vec<usize>, Error>;
    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error>;

    fn full_name(&self, name: &str) -> String {
        join_prefix(self.get_prefix(), name)
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let data = self.get_tensor_data(name)?;
        Ok(WeightTensor::new(self.full_name(name), data))
    }

    fn log_weight_list(&self) {
        for name in self.get_tensor_names() {
            match self.get_tensor_shape(&name) {
                Ok(shape) => log::debug!("{}: {:?}", name, shape),
                Err(err) => log::debug!("{}: {}", name, err),
            }
        }
    }
}

pub struct PthWeightManager {
    prefix: Option<String>,
    pth_tensors: Arc<candle_core::pickle::PthTensors>
}

impl PthWeightManager {
    pub fn new(pth_tensors: Arc<candle_core::pickle::PthTensors>) -> Self {
        Self {
            prefix: None,
            pth_tensors
        }
    }

    /// `key` selects a nested dictionary, e.g. `state_dict` in a training checkpoint.
    pub fn open(path: &Path, key: Option<&str>) -> Result<Self, Error> {
        let pth_tensors = candle_core::pickle::PthTensors::new(path, key)?;
        Ok(Self::new(Arc::new(pth_tensors)))
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(self.full_name(name)),
            pth_tensors: self.pth_tensors.clone()
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pth_tensors.tensor_infos().keys().cloned().collect();
        names.sort();
        names
    }

    fn get_tensor_shape(&self, name: &str) -> Result<Vec<usize>, Error> {
        let name = self.full_name(name);
        let tensor_info = self.pth_tensors.tensor_infos().get(&name).ok_or(Error::NoSuchTensorError(name.clone()))?;
        Ok(tensor_info.layout.shape().dims().to_vec())
    }

    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error> {
        let name = self.full_name(name);
        let tensor = self.pth_tensors.get(&name)?.ok_or(Error::NoSuchTensorError(name))?;
        TensorData::from_candle_tensor(tensor)
    }
}

pub struct SafetensorsWeightManager {
    prefix: Option<String>,
    mmap: Arc<Mmap>,
    metadata: Arc<Metadata>
}

impl SafetensorsWeightManager {
    pub fn new(mmap: Arc<Mmap>) -> Result<Self, Error> {
        let (_, metadata) = SafeTensors::read_metadata(&mmap)?;
        Ok(Self {
            prefix: None,
            mmap,
            metadata: Arc::new(metadata)
        })
    }

    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        // The mapping is read-only and lives as long as the manager.
        let mmap = unsafe { Mmap::map(&file) }?;
        Self::new(Arc::new(mmap))
    }
}

impl WeightManager for SafetensorsWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(self.full_name(name)),
            mmap: self.mmap.clone(),
            metadata: self.metadata.clone()
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metadata.tensors().keys().cloned().collect();
        names.sort();
        names
    }

    fn get_tensor_shape(&self, name: &str) -> Result<Vec<usize>, Error> {
        let name = self.full_name(name);
        let info = self.metadata.info(&name).ok_or(Error::NoSuchTensorError(name.clone()))?;
        Ok(info.shape.clone())
    }

    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error> {
        let name = self.full_name(name);
        if self.metadata.info(&name).is_none() {
            return Err(Error::NoSuchTensorError(name));
        }
        let st = SafeTensors::deserialize(&self.mmap)?;
        TensorData::from_safetensors_view(st.tensor(&name)?)
    }
}

/// In-memory parameters, e.g. the state dict of a model that has already been loaded.
#[derive(Clone)]
pub struct StateDictWeightManager {
    prefix: Option<String>,
    tensors: Arc<BTreeMap<String, TensorData>>
}

impl StateDictWeightManager {
    pub fn new(tensors: BTreeMap<String, TensorData>) -> Self {
        Self {
            prefix: None,
            tensors: Arc::new(tensors)
        }
    }
}

impl WeightManager for StateDictWeightManager {
    fn prefix(&self, name: &str) -> Self {
        Self {
            prefix: Some(self.full_name(name)),
            tensors: self.tensors.clone()
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn get_tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    fn get_tensor_shape(&self, name: &str) -> Result<Vec<usize>, Error> {
        let name = self.full_name(name);
        let data = self.tensors.get(&name).ok_or(Error::NoSuchTensorError(name.clone()))?;
        data.shape().resolve()
    }

    fn get_tensor_data(&self, name: &str) -> Result<TensorData, Error> {
        let name = self.full_name(name);
        self.tensors.get(&name).cloned().ok_or(Error::NoSuchTensorError(name))
    }
}
