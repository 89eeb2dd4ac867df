use std::hash::{Hash, Hasher};
use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{Node, SingleOutputNode};
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightExternalOutputManager;

#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
    pub denotation: Option<String>
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>, denotation: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name, denotation })
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimensionError)
    }
}

/// Named dimensions are exported symbolically even when they carry a trace value.
impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match &value.name {
                Some(name) => Some(onnx::tensor_shape_proto::dimension::Value::DimParam(name.clone())),
                None => value.value.map(|v| onnx::tensor_shape_proto::dimension::Value::DimValue(v as i64))
            },
            denotation: value.denotation.clone().unwrap_or_default()
        }
    }
}

impl From<usize> for Dimension {
    fn from(value: usize) -> Self {
        Self { value: Some(value), name: None, denotation: None }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other) || if let (Some(a), Some(b)) = (self.value, other.value) {a == b} else {false}
    }
}

#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        self.dims.iter().map(|dim| dim.resolve()).collect()
    }

    pub fn transpose(&self) -> Self {
        Self {
            dims: self.dims.iter().rev().cloned().collect()
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut v = 1;
        for dim in &self.dims {
            v *= dim.resolve()?;
        }
        Ok(v)
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len() && self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl From<&Shape> for onnx::TensorShapeProto {
    fn from(value: &Shape) -> Self {
        Self {
            dim: value.dims.iter().map(|x| x.as_ref().into()).collect()
        }
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape { dims: value.dims().iter().map(|x| Dimension::new(Some(*x), None, None)).collect() }
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl <T: Clone> From<&[T]> for Shape
where
    Dimension: From<T>
{
    fn from(value: &[T]) -> Self {
        Shape { dims: value.iter().map(|x| Arc::new(Dimension::from(x.clone()))).collect() }
    }
}

impl <T> From<Vec<T>> for Shape
where
    Dimension: From<T>
{
    fn from(value: Vec<T>) -> Self {
        Shape { dims: value.into_iter().map(|x| Arc::new(Dimension::from(x))).collect() }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I32,
    I64
}

impl DType {
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Result<Self, Error> {
        match dtype {
            safetensors::Dtype::F64 => Ok(DType::F64),
            safetensors::Dtype::F32 => Ok(DType::F32),
            safetensors::Dtype::F16 => Ok(DType::F16),
            safetensors::Dtype::BF16 => Ok(DType::BF16),
            safetensors::Dtype::I32 => Ok(DType::I32),
            safetensors::Dtype::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F64 => Ok(DType::F64),
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::BF16 => Ok(DType::BF16),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            _ => Err(Error::UnsupportedDTypeError)
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F64 => onnx::tensor_proto::DataType::Double,
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::BF16 => onnx::tensor_proto::DataType::Bfloat16,
            DType::I32 => onnx::tensor_proto::DataType::Int32,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

pub trait Tensor {
    fn dtype(&self) -> DType;
    fn shape(&self) -> &Shape;
    fn rank(&self) -> usize {
        self.shape().rank()
    }
    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto{
            name,
            r#type: Some(
                onnx::TypeProto{
                    value: Some(
                        onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                            elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                            shape: Some(self.shape().into())
                        })
                    ),
                    denotation: String::new()
                }
            ),
            .. Default::default()
        }
    }

    /// The node producing this tensor, if it is not a graph input or weight.
    fn get_node(&self) -> Option<&dyn Node> {
        None
    }

    fn gather_weights<'a>(&'a self, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        Ok(())
    }

    fn get_initializer<'a>(&'a self, _name: String, _manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<onnx::TensorProto>, Error> {
        Ok(None)
    }

    fn get_name(&self) -> Option<&str> {
        None
    }
}

impl<'a> PartialEq for &'a dyn Tensor{
    fn eq(&self, other:&Self) -> bool{
        std::ptr::addr_eq(*self, *other)
    }
}

impl<'a> Eq for &'a dyn Tensor{}

impl<'a> Hash for &'a dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

impl <T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn get_node(&self) -> Option<&dyn Node> {
        Some(self)
    }
}

pub struct InputTensor {
    data_type: DType,
    name: String,
    shape: Shape
}

impl InputTensor {
    pub fn new(name: String, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {name, data_type, shape })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// A named parameter tensor, exported as a graph initializer.
pub struct WeightTensor {
    name: String,
    data: TensorData
}

impl WeightTensor {
    pub fn new(name: String, data: TensorData) -> Arc<Self> {
        Arc::new(Self {name, data})
    }
}

impl Tensor for WeightTensor {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn shape(&self) -> &Shape {
        self.data.shape()
    }

    fn gather_weights<'a>(&'a self, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<(), Error> {
        manager.write_tensor_data(self, &self.data)
    }

    fn get_initializer<'a>(&'a self, name: String, manager: &mut dyn WeightExternalOutputManager<'a>) -> Result<Option<TensorProto>, Error> {
        manager.get_initializer(self, name)
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorDataValue {
    F64(Vec<f64>),
    F32(Vec<f32>),
    BF16(Vec<half::bf16>),
    F16(Vec<half::f16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F64(v) => v.len(),
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::I32(v) => v.len(),
            TensorDataValue::BF16(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F64(_) => DType::F64,
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::BF16(_) => DType::BF16,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I32(_) => DType::I32,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn get_raw_encoding(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_raw_encoding(dtype: DType, data: &[u8]) -> Result<Self, Error> {
        if data.len() % dtype.size_in_bytes() != 0 {
            return Err(Error::InvalidInputError);
        }
        // chunks_exact guarantees the slice lengths the array conversions need
        Ok(match dtype {
            DType::F64 => TensorDataValue::F64(data.chunks_exact(8).map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])).collect()),
            DType::F32 => TensorDataValue::F32(data.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::F16 => TensorDataValue::F16(data.chunks_exact(2).map(|c| half::f16::from_le_bytes([c[0], c[1]])).collect()),
            DType::BF16 => TensorDataValue::BF16(data.chunks_exact(2).map(|c| half::bf16::from_le_bytes([c[0], c[1]])).collect()),
            DType::I32 => TensorDataValue::I32(data.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::I64 => TensorDataValue::I64(data.chunks_exact(8).map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])).collect()),
        })
    }

    /// Widens or narrows floating point data to f32, as a parameter copy into an f32 model would.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, Error> {
        match self {
            TensorDataValue::F64(v) => Ok(v.iter().map(|x| *x as f32).collect()),
            TensorDataValue::F32(v) => Ok(v.clone()),
            TensorDataValue::BF16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorDataValue::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            _ => Err(Error::UnsupportedDTypeError),
        }
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::InvalidInputError);
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        let data = vec![value; num_elements];
        Self::new(TensorDataValue::from(data), shape)
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, Error> {
        self.value.to_f32_vec()
    }

    pub fn to_tensor_data_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto{
            name: name.unwrap_or_default(),
            data_type: (onnx::tensor_proto::DataType::from(self.value.dtype()) as i32),
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.get_raw_encoding(),
            ..Default::default()
        })
    }

    pub fn from_candle_tensor(tensor: candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match DType::from_candle(tensor.dtype())? {
            DType::F64 => TensorDataValue::F64(flat.to_vec1()?),
            DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            DType::BF16 => TensorDataValue::BF16(flat.to_vec1()?),
            DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            DType::I32 => return Err(Error::UnsupportedDTypeError),
        };
        Self::new(value, shape)
    }

    pub(crate) fn to_raw_encoding(&self) -> Vec<u8> {
        self.value.get_raw_encoding()
    }

    pub fn from_safetensors_view(tensor: safetensors::tensor::TensorView) -> Result<Self, Error> {
        let dtype = DType::from_safetensors(tensor.dtype())?;
        let shape = Shape::from(tensor.shape());
        let value = TensorDataValue::from_raw_encoding(dtype, tensor.data())?;
        Self::new(value, shape)
    }
}
