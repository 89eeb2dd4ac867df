use std::collections::BTreeMap;
use std::sync::Arc;
use ndarray::{s, Array1, Array2, Array3};
use rand::Rng;
use rand::rngs::ThreadRng;
use onnx_graph::{build_proto, onnx, ModelHeader, WeightStorageStrategy};
use onnx_graph::operators::Relu;
use onnx_graph::pytorch::{conv1d, flatten_batch, linear, Conv1dOptions};
use onnx_graph::tensor::{DType, Dimension, InputTensor, Shape, Tensor, TensorData, TensorDataValue};
use onnx_graph::weights::{StateDictWeightManager, WeightManager};
use crate::checkpoint::check_state_dict;
use crate::config::{Activation, ExportMetadata, ModelArchitecture, BATCH_AXIS, INPUT_NAME, METADATA_KEY, OPSET_VERSION, OUTPUT_NAME, PRODUCER_NAME, SIGNAL_CHANNELS, SIGNAL_LENGTH};
use crate::Error;

#[derive(Clone, Debug, PartialEq)]
pub struct Conv1dParams {
    /// `[out_channels, in_channels, kernel_size]`
    pub weight: Array3<f32>,
    pub bias: Array1<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinearParams {
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

/// The PPG network, in training mode until [`PpgModel::eval`] freezes it.
#[derive(Clone, Debug)]
pub struct PpgModel {
    architecture: ModelArchitecture,
    conv: Conv1dParams,
    fc: LinearParams,
}

// Uniform(-1/sqrt(fan_in), 1/sqrt(fan_in)), as torch initializes Conv1d and Linear
fn uniform_init(rng: &mut ThreadRng, fan_in: usize) -> impl FnMut() -> f32 + '_ {
    let bound = 1.0 / (fan_in as f32).sqrt();
    move || rng.gen_range(-bound..=bound)
}

impl PpgModel {
    pub fn new(architecture: ModelArchitecture) -> Result<Self, Error> {
        architecture.validate()?;
        let mut rng = rand::thread_rng();
        let conv_fan_in = architecture.in_channels * architecture.kernel_size;
        let conv = Conv1dParams {
            weight: Array3::from_shape_simple_fn((architecture.conv_channels, architecture.in_channels, architecture.kernel_size), uniform_init(&mut rng, conv_fan_in)),
            bias: Array1::from_shape_simple_fn(architecture.conv_channels, uniform_init(&mut rng, conv_fan_in)),
        };
        let fc = LinearParams {
            weight: Array2::from_shape_simple_fn((architecture.num_outputs(), architecture.fc_in_features), uniform_init(&mut rng, architecture.fc_in_features)),
            bias: Array1::from_shape_simple_fn(architecture.num_outputs(), uniform_init(&mut rng, architecture.fc_in_features)),
        };
        Ok(Self { architecture, conv, fc })
    }

    pub fn architecture(&self) -> &ModelArchitecture {
        &self.architecture
    }

    /// Strict load: keys and shapes must match exactly. Parameters are converted to f32.
    pub fn load_state_dict(&mut self, weights: &dyn WeightManager) -> Result<(), Error> {
        check_state_dict(&self.architecture, weights)?;
        let read = |name: &str| -> Result<(Vec<usize>, Vec<f32>), Error> {
            let data = weights.get_tensor_data(name)?;
            Ok((data.shape().resolve()?, data.to_f32_vec()?))
        };

        let (shape, values) = read("conv.weight")?;
        let conv_weight = Array3::from_shape_vec((shape[0], shape[1], shape[2]), values)?;
        let (_, values) = read("conv.bias")?;
        let conv_bias = Array1::from_vec(values);
        let (shape, values) = read("fc.weight")?;
        let fc_weight = Array2::from_shape_vec((shape[0], shape[1]), values)?;
        let (_, values) = read("fc.bias")?;
        let fc_bias = Array1::from_vec(values);

        self.conv = Conv1dParams { weight: conv_weight, bias: conv_bias };
        self.fc = LinearParams { weight: fc_weight, bias: fc_bias };
        log::info!("Loaded {} parameter tensors", self.architecture.parameter_shapes().len());
        Ok(())
    }

    pub fn state_dict(&self) -> Result<BTreeMap<String, TensorData>, Error> {
        let tensor = |values: Vec<f32>, shape: &[usize]| TensorData::new(TensorDataValue::F32(values), Shape::from(shape));
        let mut out = BTreeMap::new();
        out.insert("conv.weight".to_string(), tensor(self.conv.weight.iter().copied().collect(), self.conv.weight.shape())?);
        out.insert("conv.bias".to_string(), tensor(self.conv.bias.to_vec(), self.conv.bias.shape())?);
        out.insert("fc.weight".to_string(), tensor(self.fc.weight.iter().copied().collect(), self.fc.weight.shape())?);
        out.insert("fc.bias".to_string(), tensor(self.fc.bias.to_vec(), self.fc.bias.shape())?);
        Ok(out)
    }

    /// Switches to inference mode. The network has no dropout or batch norm, so this only freezes it.
    pub fn eval(self) -> InferenceModel {
        InferenceModel { model: self }
    }
}

/// A frozen [`PpgModel`]: the only state that can run a forward pass or be exported.
#[derive(Clone, Debug)]
pub struct InferenceModel {
    model: PpgModel,
}

impl InferenceModel {
    pub fn architecture(&self) -> &ModelArchitecture {
        &self.model.architecture
    }

    pub fn state_dict(&self) -> Result<BTreeMap<String, TensorData>, Error> {
        self.model.state_dict()
    }

    /// `[batch, channels, samples]` to `[batch, 2]`.
    pub fn forward(&self, input: &Array3<f32>) -> Result<Array2<f32>, Error> {
        let arch = &self.model.architecture;
        let (batch, channels, length) = input.dim();
        let trace_error = |reason: String| Error::TraceError { actual: input.shape().to_vec(), reason };
        if channels != arch.in_channels {
            return Err(trace_error(format!("expected {} input channels, got {}", arch.in_channels, channels)));
        }
        let out_length = arch.conv_output_length(length)
            .ok_or_else(|| trace_error(format!("signal of {} samples is shorter than the convolution window", length)))?;
        let features = arch.conv_channels.checked_mul(out_length).unwrap_or(usize::MAX);
        if features != arch.fc_in_features {
            return Err(trace_error(format!("flattened convolution output has {} features, the linear layer expects {}", features, arch.fc_in_features)));
        }
        let padded_length = arch.padded_length(length)
            .ok_or_else(|| trace_error(format!("padding {} overflows a signal of {} samples", arch.padding, length)))?;

        let mut padded = Array3::<f32>::zeros((batch, channels, padded_length));
        padded.slice_mut(s![.., .., arch.padding..arch.padding + length]).assign(input);

        let weight = &self.model.conv.weight;
        let mut x = Array3::<f32>::zeros((batch, arch.conv_channels, out_length));
        for b in 0..batch {
            for o in 0..arch.conv_channels {
                for t in 0..out_length {
                    let mut acc = self.model.conv.bias[o];
                    for c in 0..channels {
                        for k in 0..arch.kernel_size {
                            acc += weight[[o, c, k]] * padded[[b, c, t * arch.stride + k * arch.dilation]];
                        }
                    }
                    x[[b, o, t]] = acc;
                }
            }
        }

        if arch.activation == Activation::Relu {
            x.mapv_inplace(|v| v.max(0.0));
        }

        let x = x.into_shape_with_order((batch, features))?;
        let mut y = x.dot(&self.model.fc.weight.t());
        y += &self.model.fc.bias;
        Ok(y)
    }

    /// Builds the ONNX model, first running `representative_input` through [`Self::forward`]
    /// so that an input the network cannot take fails here rather than in a runtime.
    pub fn to_onnx(&self, representative_input: &Array3<f32>, storage: WeightStorageStrategy) -> Result<onnx::ModelProto, Error> {
        self.forward(representative_input)?;
        let arch = self.architecture();
        let (batch, channels, length) = representative_input.dim();

        let batch_dim = Dimension::new(Some(batch), Some(BATCH_AXIS.to_string()), Some("DATA_BATCH".to_string()));
        let input: Arc<dyn Tensor> = InputTensor::new(INPUT_NAME.to_string(), DType::F32, Shape::new(vec![
            batch_dim,
            Dimension::new(Some(channels), None, Some("DATA_CHANNEL".to_string())),
            Dimension::new(Some(length), None, Some("DATA_FEATURE".to_string())),
        ]));
        let weights = StateDictWeightManager::new(self.state_dict()?);

        let x = conv1d(&weights.prefix("conv"), input.clone(), &Conv1dOptions {
            stride: arch.stride,
            padding: arch.padding,
            dilation: arch.dilation,
            groups: 1,
        })?;
        let x = match arch.activation {
            Activation::Relu => Relu::new(None, x)? as Arc<dyn Tensor>,
            Activation::None => x,
        };
        let x = flatten_batch(x)?;
        let output = linear(&weights.prefix("fc"), x)?;

        let header = ModelHeader {
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            opset_version: OPSET_VERSION,
            doc_string: "PPG blood pressure regression: input_signal [batch_size, 1, 120] -> sbp_dbp [batch_size, 2]".to_string(),
            metadata_props: vec![(METADATA_KEY.to_string(), serde_json::to_string(&ExportMetadata::new(arch))?)],
        };
        let model = build_proto(&[input], &[(OUTPUT_NAME.to_string(), output)], storage, &header)?;
        log::debug!("Built graph with {} nodes", model.graph.as_ref().map(|g| g.node.len()).unwrap_or(0));
        Ok(model)
    }
}

/// A random `(1, 1, 120)` signal. Only its shape and dtype reach the exported graph.
pub fn representative_input() -> Array3<f32> {
    let mut rng = rand::thread_rng();
    Array3::from_shape_simple_fn((1, SIGNAL_CHANNELS, SIGNAL_LENGTH), || rng.gen_range(-1.0..1.0))
}
