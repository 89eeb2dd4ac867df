use std::sync::Arc;
use crate::{onnx, Error};
use crate::node::{attribute_float, attribute_int, attribute_ints, Node, SingleOutputNode};
use crate::tensor::{DType, Dimension, Shape, Tensor};

fn validate_float_dtype(dtype: DType) -> Result<(), Error> {
    match dtype {
        DType::F32 | DType::F16 | DType::BF16 | DType::F64 => Ok(()),
        _ => Err(Error::InvalidDTypeError)
    }
}

/// Convolution over the trailing spatial axes of an `N x C x D1 x ... x Dn` input.
pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel_shape: Vec<i64>,
    strides: Vec<i64>,
    pads: Vec<i64>,
    dilations: Vec<i64>,
    group: i64,
    output_shape: Shape,
    output_dtype: DType
}

impl Conv {
    /// `pads` holds the leading pads of every spatial axis followed by the trailing pads, as in ONNX.
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, weight: Arc<dyn Tensor>, bias: Option<Arc<dyn Tensor>>, strides: Vec<usize>, pads: Vec<usize>, dilations: Vec<usize>, group: usize) -> Result<Arc<Self>, Error> {
        validate_float_dtype(input.dtype())?;
        if input.dtype() != weight.dtype() {
            return Err(Error::DTypeMismatchError);
        }
        if let Some(bias) = &bias {
            if bias.dtype() != input.dtype() {
                return Err(Error::DTypeMismatchError);
            }
        }
        let input_shape = input.shape();
        let weight_shape = weight.shape();
        if input_shape.rank() < 3 || input_shape.rank() != weight_shape.rank() {
            return Err(Error::InputShapeError("Conv"));
        }
        let spatial_rank = input_shape.rank() - 2;
        if strides.len() != spatial_rank || dilations.len() != spatial_rank || pads.len() != spatial_rank * 2 {
            return Err(Error::InvalidInputError);
        }
        if group == 0 || strides.contains(&0) || dilations.contains(&0) {
            return Err(Error::InvalidInputError);
        }

        let in_channels = input_shape[1].resolve()?;
        let out_channels = weight_shape[0].resolve()?;
        if weight_shape[1].resolve()? * group != in_channels || out_channels % group != 0 {
            return Err(Error::InputShapeError("Conv"));
        }
        if let Some(bias) = &bias {
            if bias.rank() != 1 || bias.shape()[0].resolve()? != out_channels {
                return Err(Error::InputShapeError("Conv"));
            }
        }

        let mut kernel_shape = vec![];
        let mut output_dims = vec![input_shape[0].clone(), Dimension::new(Some(out_channels), None, None)];
        for axis in 0..spatial_rank {
            let length = input_shape[axis + 2].resolve()?;
            let kernel = weight_shape[axis + 2].resolve()?;
            if kernel == 0 {
                return Err(Error::InputShapeError("Conv"));
            }
            let padded = length + pads[axis] + pads[axis + spatial_rank];
            let receptive = dilations[axis] * (kernel - 1) + 1;
            if padded < receptive {
                return Err(Error::InputShapeError("Conv"));
            }
            kernel_shape.push(kernel as i64);
            output_dims.push(Dimension::new(Some((padded - receptive) / strides[axis] + 1), None, None));
        }

        Ok(Arc::new(Self {
            name,
            output_dtype: input.dtype(),
            input,
            weight,
            bias,
            kernel_shape,
            strides: strides.iter().map(|x| *x as i64).collect(),
            pads: pads.iter().map(|x| *x as i64).collect(),
            dilations: dilations.iter().map(|x| *x as i64).collect(),
            group: group as i64,
            output_shape: Shape::new(output_dims)
        }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attribute_ints("dilations", self.dilations.clone()),
            attribute_int("group", self.group),
            attribute_ints("kernel_shape", self.kernel_shape.clone()),
            attribute_ints("pads", self.pads.clone()),
            attribute_ints("strides", self.strides.clone()),
        ]
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}

pub struct Relu {
    name: Option<String>,
    input: Arc<dyn Tensor>
}

impl Relu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>) -> Result<Arc<Relu>, Error> {
        validate_float_dtype(input.dtype())?;
        Ok(Arc::new(Relu {
            name,
            input
        }))
    }
}

impl Node for Relu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Relu"
    }
}

impl SingleOutputNode for Relu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Collapses the input into a 2D matrix split at `axis`.
pub struct Flatten {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    axis: i64,
    output_shape: Shape
}

impl Flatten {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, axis: usize) -> Result<Arc<Self>, Error> {
        let input_shape = input.shape();
        if axis > input_shape.rank() {
            return Err(Error::InputShapeError("Flatten"));
        }
        // A lone leading dimension is carried through so symbolic batch axes survive.
        let outer = if axis == 1 {
            input_shape[0].clone()
        } else {
            Dimension::new(Some(Shape::new(input_shape.dims[..axis].to_vec()).num_elements()?), None, None)
        };
        let inner = Dimension::new(Some(Shape::new(input_shape.dims[axis..].to_vec()).num_elements()?), None, None);
        Ok(Arc::new(Self {
            name,
            input,
            axis: axis as i64,
            output_shape: Shape::new(vec![outer, inner])
        }))
    }
}

impl Node for Flatten {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Flatten"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attribute_int("axis", self.axis)]
    }
}

impl SingleOutputNode for Flatten {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Gemm {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
    c: Option<Arc<dyn Tensor>>,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    beta: f32,
    output_dtype: DType,
    output_shape: Shape
}

impl Gemm {
    pub fn new(name: Option<String>, a: Arc<dyn Tensor>, b: Arc<dyn Tensor>, c: Option<Arc<dyn Tensor>>, trans_a: bool, trans_b: bool, alpha: f32, beta: f32) -> Result<Arc<Self>, Error> {
        if a.dtype() != b.dtype() {
            return Err(Error::DTypeMismatchError)
        }
        if let Some(c) = &c {
            if c.dtype() != a.dtype() {
                return Err(Error::DTypeMismatchError)
            }
        }
        let a_shape = if trans_a {
            a.shape().transpose()
        } else {
            a.shape().clone()
        };
        let b_shape = if trans_b {
            b.shape().transpose()
        } else {
            b.shape().clone()
        };
        if a_shape.rank() != 2 || b_shape.rank() != 2 {
            return Err(Error::InputShapeError("Gemm"))
        }
        if a_shape[1].as_ref() != b_shape[0].as_ref() {
            return Err(Error::InputShapeError("Gemm"))
        }
        if let Some(c) = &c {
            // C must be unidirectionally broadcastable to (M, N); only the column count is checked.
            let n = b_shape[1].resolve()?;
            let c_cols = c.shape().dims.last().map(|d| d.resolve()).transpose()?.unwrap_or(1);
            if c.rank() > 2 || (c_cols != n && c_cols != 1) {
                return Err(Error::InputShapeError("Gemm"))
            }
        }
        let output_shape = Shape::new(vec![a_shape[0].clone(), b_shape[1].clone()]);
        let output_dtype = a.dtype();
        Ok(Arc::new(Self {
            name,
            a,
            b,
            c,
            trans_a,
            trans_b,
            alpha,
            beta,
            output_dtype,
            output_shape
        }))
    }
}

impl Node for Gemm {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        if let Some(c) = &self.c {
            vec![&*self.a, &*self.b, c.as_ref()]
        } else {
            vec![&*self.a, &*self.b]
        }
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Gemm"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attribute_float("alpha", self.alpha),
            attribute_float("beta", self.beta),
            attribute_int("transA", self.trans_a as i64),
            attribute_int("transB", self.trans_b as i64),
        ]
    }
}

impl SingleOutputNode for Gemm {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.output_dtype
    }
}
