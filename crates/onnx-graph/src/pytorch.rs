use std::sync::Arc;
use crate::Error;
use crate::operators::{Conv, Flatten, Gemm};
use crate::tensor::Tensor;
use crate::weights::WeightManager;

#[derive(Clone, Debug, PartialEq)]
pub struct Conv1dOptions {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize
}

impl Default for Conv1dOptions {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
            groups: 1
        }
    }
}

/// `nn.Conv1d`: `weight` is `[out, in / groups, kernel]`, `bias` is optional.
pub fn conv1d(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>, options: &Conv1dOptions) -> Result<Arc<dyn Tensor>, Error> {
    let bias = if weight_manager.get_tensor_shape("bias").is_ok() {
        Some(weight_manager.get_tensor("bias")?)
    } else {
        None
    };
    Ok(Conv::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        bias,
        vec![options.stride],
        vec![options.padding, options.padding],
        vec![options.dilation],
        options.groups
    )?)
}

/// `nn.Linear` on a `[batch, features]` input, exported as a single `Gemm` with `transB`.
pub fn linear(weight_manager: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    if input.rank() != 2 {
        return Err(Error::InputShapeError("Linear"));
    }
    let bias = if weight_manager.get_tensor_shape("bias").is_ok() {
        Some(weight_manager.get_tensor("bias")?)
    } else {
        None
    };
    Ok(Gemm::new(
        weight_manager.get_prefix().map(|x| x.to_string()),
        input,
        weight_manager.get_tensor("weight")?,
        bias,
        false,
        true,
        1.0,
        1.0
    )?)
}

/// `x.view(x.size(0), -1)`
pub fn flatten_batch(input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(Flatten::new(None, input, 1)?)
}
