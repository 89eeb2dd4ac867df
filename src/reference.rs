//! Loads an exported model back, reports its declared input/output contract and runs it through
//! candle's ONNX evaluator for comparison against the native forward pass.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use candle_core::{Device, Tensor};
use ndarray::{ArrayD, IxDyn};
use prost::Message;
use onnx_graph::onnx;

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("Protobuf decoding error")]
    ProtobufDecodeError(#[from] prost::DecodeError),
    #[error("Missing field \"{0}\"")]
    MissingField(&'static str),
    #[error("Unsupported dtype {0}")]
    UnsupportedDType(i32),
    #[error("Unknown tensor name \"{0}\"")]
    UnknownTensorName(String),
    #[error("Invalid dimension {0}")]
    InvalidDimension(i64),
    #[error("Invalid external data for initializer \"{0}\"")]
    InvalidExternalData(String),
    #[error("Input has rank {actual}, \"{name}\" declares rank {expected}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: usize
    },
    #[error("Input dimension {axis} is {actual}, \"{name}\" declares {expected}")]
    DimensionMismatch {
        name: String,
        axis: usize,
        expected: usize,
        actual: usize
    },
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeclaredDim {
    Fixed(usize),
    /// Symbolic dimension, e.g. `batch_size`. Accepts any size.
    Dynamic(String)
}

/// A graph input or output as declared in the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueContract {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<DeclaredDim>
}

impl ValueContract {
    fn from_value_info(info: &onnx::ValueInfoProto) -> Result<Self, ReferenceError> {
        let type_proto = info.r#type.as_ref().ok_or(ReferenceError::MissingField("value_info.type"))?;
        let Some(onnx::type_proto::Value::TensorType(tensor_type)) = &type_proto.value else {
            return Err(ReferenceError::MissingField("value_info.type.tensor_type"));
        };
        let shape = tensor_type.shape.as_ref().ok_or(ReferenceError::MissingField("tensor_type.shape"))?;
        let mut dims = vec![];
        for dim in &shape.dim {
            dims.push(match &dim.value {
                Some(onnx::tensor_shape_proto::dimension::Value::DimValue(x)) => {
                    if *x <= 0 {
                        return Err(ReferenceError::InvalidDimension(*x));
                    }
                    DeclaredDim::Fixed(*x as usize)
                }
                Some(onnx::tensor_shape_proto::dimension::Value::DimParam(name)) => DeclaredDim::Dynamic(name.clone()),
                None => DeclaredDim::Dynamic(String::new()),
            });
        }
        Ok(Self {
            name: info.name.clone(),
            elem_type: tensor_type.elem_type,
            dims
        })
    }

    pub fn is_float(&self) -> bool {
        self.elem_type == onnx::tensor_proto::DataType::Float as i32
    }

    /// Checks a concrete shape against the declaration: fixed dimensions must match exactly.
    pub fn check_shape(&self, shape: &[usize]) -> Result<(), ReferenceError> {
        if shape.len() != self.dims.len() {
            return Err(ReferenceError::RankMismatch { name: self.name.clone(), expected: self.dims.len(), actual: shape.len() });
        }
        for (axis, (dim, actual)) in self.dims.iter().zip(shape).enumerate() {
            if let DeclaredDim::Fixed(expected) = dim {
                if expected != actual {
                    return Err(ReferenceError::DimensionMismatch { name: self.name.clone(), axis, expected: *expected, actual: *actual });
                }
            }
        }
        Ok(())
    }
}

/// Replaces external initializer references with their bytes so the model is self-contained.
fn inline_external_data(graph: &mut onnx::GraphProto, base_dir: Option<&Path>) -> Result<(), ReferenceError> {
    let mut files: HashMap<PathBuf, Vec<u8>> = HashMap::new();
    for tensor in graph.initializer.iter_mut() {
        if tensor.data_location != onnx::tensor_proto::DataLocation::External as i32 {
            continue;
        }
        let invalid = || ReferenceError::InvalidExternalData(tensor.name.clone());
        let entry = |key: &str| tensor.external_data.iter().find(|e| e.key == key).map(|e| e.value.clone());
        let base_dir = base_dir.ok_or_else(invalid)?;
        let location = entry("location").ok_or_else(invalid)?;
        let path = base_dir.join(location);
        if !files.contains_key(&path) {
            let data = std::fs::read(&path)?;
            files.insert(path.clone(), data);
        }
        let data = &files[&path];

        let offset = match entry("offset") {
            Some(x) => x.parse::<usize>().map_err(|_| invalid())?,
            None => 0
        };
        let length = match entry("length") {
            Some(x) => x.parse::<usize>().map_err(|_| invalid())?,
            None => data.len().checked_sub(offset).ok_or_else(invalid)?
        };
        let end = offset.checked_add(length).ok_or_else(invalid)?;
        let bytes = data.get(offset..end).ok_or_else(invalid)?.to_vec();

        tensor.raw_data = bytes;
        tensor.external_data.clear();
        tensor.data_location = onnx::tensor_proto::DataLocation::Default as i32;
    }
    Ok(())
}

fn to_ndarray(tensor: &Tensor) -> Result<ArrayD<f32>, ReferenceError> {
    let shape = tensor.dims().to_vec();
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
}

pub struct ReferenceModel {
    model: onnx::ModelProto,
    inputs: Vec<ValueContract>,
    outputs: Vec<ValueContract>,
    candle_proto: candle_onnx::onnx::ModelProto
}

impl ReferenceModel {
    /// `base_dir` resolves external data locations; models with embedded weights need none.
    pub fn from_bytes(bytes: &[u8], base_dir: Option<&Path>) -> Result<Self, ReferenceError> {
        let mut model = onnx::ModelProto::decode(bytes)?;
        let graph = model.graph.as_mut().ok_or(ReferenceError::MissingField("graph"))?;
        inline_external_data(graph, base_dir)?;

        let initializer_names: Vec<&str> = graph.initializer.iter().map(|x| x.name.as_str()).collect();
        let inputs = graph.input.iter()
            .filter(|x| !initializer_names.contains(&x.name.as_str()))
            .map(ValueContract::from_value_info)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = graph.output.iter()
            .map(ValueContract::from_value_info)
            .collect::<Result<Vec<_>, _>>()?;

        // candle only reads models from disk
        let temp_file = tempfile::NamedTempFile::new()?;
        std::fs::write(temp_file.path(), model.encode_to_vec())?;
        let candle_proto = candle_onnx::read_file(temp_file.path())?;

        Ok(Self {
            model,
            inputs,
            outputs,
            candle_proto
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ReferenceError> {
        let bytes = std::fs::read(path)?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        Self::from_bytes(&bytes, Some(base_dir))
    }

    pub fn inputs(&self) -> &[ValueContract] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueContract] {
        &self.outputs
    }

    pub fn producer_name(&self) -> &str {
        &self.model.producer_name
    }

    /// Version of the default operator set.
    pub fn opset_version(&self) -> Option<i64> {
        self.model.opset_import.iter().find(|x| x.domain.is_empty()).map(|x| x.version)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.model.metadata_props.iter().find(|x| x.key == key).map(|x| x.value.as_str())
    }

    pub fn node_types(&self) -> Vec<&str> {
        self.model.graph.iter().flat_map(|g| g.node.iter()).map(|x| x.op_type.as_str()).collect()
    }

    pub fn initializer(&self, name: &str) -> Result<ArrayD<f32>, ReferenceError> {
        let tensor = self.model.graph.iter()
            .flat_map(|g| g.initializer.iter())
            .find(|x| x.name == name)
            .ok_or_else(|| ReferenceError::UnknownTensorName(name.to_string()))?;
        if tensor.data_type != onnx::tensor_proto::DataType::Float as i32 {
            return Err(ReferenceError::UnsupportedDType(tensor.data_type));
        }
        let mut shape = vec![];
        for dim in &tensor.dims {
            if *dim < 0 {
                return Err(ReferenceError::InvalidDimension(*dim));
            }
            shape.push(*dim as usize);
        }
        let tensor = Tensor::from_raw_buffer(&tensor.raw_data, candle_core::DType::F32, &shape, &Device::Cpu)?;
        to_ndarray(&tensor)
    }

    /// Runs the graph on its single input and returns the first output.
    pub fn run(&self, input: ArrayD<f32>) -> Result<ArrayD<f32>, ReferenceError> {
        let input_contract = self.inputs.first().ok_or(ReferenceError::MissingField("graph.input"))?;
        let output_contract = self.outputs.first().ok_or(ReferenceError::MissingField("graph.output"))?;
        input_contract.check_shape(input.shape())?;

        let shape = input.shape().to_vec();
        let input = Tensor::from_vec(input.iter().copied().collect::<Vec<_>>(), shape, &Device::Cpu)?;
        let mut inputs = HashMap::new();
        inputs.insert(input_contract.name.clone(), input);

        let mut outputs = candle_onnx::simple_eval(&self.candle_proto, inputs)?;
        let output = outputs.remove(&output_contract.name)
            .ok_or_else(|| ReferenceError::UnknownTensorName(output_contract.name.clone()))?;
        log::trace!("{} -> {:?}", output_contract.name, output.dims());
        let output = to_ndarray(&output)?;
        output_contract.check_shape(output.shape())?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_value_info(name: &str, dims: Vec<onnx::tensor_shape_proto::dimension::Value>) -> onnx::ValueInfoProto {
        onnx::ValueInfoProto {
            name: name.to_string(),
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                    elem_type: onnx::tensor_proto::DataType::Float as i32,
                    shape: Some(onnx::TensorShapeProto {
                        dim: dims.into_iter().map(|v| onnx::tensor_shape_proto::Dimension { value: Some(v), denotation: String::new() }).collect()
                    })
                })),
                denotation: String::new()
            }),
            ..Default::default()
        }
    }

    fn external_initializer(name: &str, entries: &[(&str, &str)]) -> onnx::TensorProto {
        onnx::TensorProto {
            name: name.to_string(),
            data_type: onnx::tensor_proto::DataType::Float as i32,
            dims: vec![2],
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: entries.iter().map(|(key, value)| onnx::StringStringEntryProto {
                key: key.to_string(),
                value: value.to_string(),
            }).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn contract_distinguishes_fixed_and_dynamic_dims() {
        use onnx::tensor_shape_proto::dimension::Value;
        let info = float_value_info("x", vec![Value::DimParam("batch_size".to_string()), Value::DimValue(1), Value::DimValue(120)]);
        let contract = ValueContract::from_value_info(&info).unwrap();
        assert_eq!(contract.dims, vec![DeclaredDim::Dynamic("batch_size".to_string()), DeclaredDim::Fixed(1), DeclaredDim::Fixed(120)]);
        assert!(contract.is_float());
        contract.check_shape(&[7, 1, 120]).unwrap();
        assert!(matches!(contract.check_shape(&[1, 1, 119]), Err(ReferenceError::DimensionMismatch { axis: 2, .. })));
        assert!(matches!(contract.check_shape(&[1, 120]), Err(ReferenceError::RankMismatch { .. })));
    }

    #[test]
    fn external_initializers_are_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<u8> = [7.0f32, 1.0, 2.0, 9.0].iter().flat_map(|x| x.to_le_bytes()).collect();
        std::fs::write(dir.path().join("weights.bin"), values).unwrap();

        let mut graph = onnx::GraphProto {
            initializer: vec![external_initializer("w", &[("location", "weights.bin"), ("offset", "4"), ("length", "8")])],
            ..Default::default()
        };
        inline_external_data(&mut graph, Some(dir.path())).unwrap();
        let tensor = &graph.initializer[0];
        assert_eq!(tensor.data_location, onnx::tensor_proto::DataLocation::Default as i32);
        assert!(tensor.external_data.is_empty());
        assert_eq!(tensor.raw_data, [1.0f32, 2.0].iter().flat_map(|x| x.to_le_bytes()).collect::<Vec<u8>>());
    }

    #[test]
    fn external_data_out_of_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weights.bin"), [0u8; 8]).unwrap();

        let mut graph = onnx::GraphProto {
            initializer: vec![external_initializer("w", &[("location", "weights.bin"), ("offset", "4"), ("length", "8")])],
            ..Default::default()
        };
        assert!(matches!(inline_external_data(&mut graph, Some(dir.path())), Err(ReferenceError::InvalidExternalData(name)) if name == "w"));
        assert!(matches!(inline_external_data(&mut graph, None), Err(ReferenceError::InvalidExternalData(_))));
    }
}
