use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::Error;

pub const INPUT_NAME: &str = "input_signal";
pub const OUTPUT_NAME: &str = "sbp_dbp";
pub const BATCH_AXIS: &str = "batch_size";
pub const SIGNAL_CHANNELS: usize = 1;
pub const SIGNAL_LENGTH: usize = 120;
pub const OUTPUT_LABELS: [&str; 2] = ["sbp", "dbp"];
pub const OPSET_VERSION: i64 = 17;
pub const PRODUCER_NAME: &str = "ppg-onnx";
pub const METADATA_KEY: &str = "ppg_onnx_metadata";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu
}

/// Layer hyperparameters of the PPG network: `Conv1d -> [ReLU] -> flatten -> Linear`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelArchitecture {
    pub in_channels: usize,
    pub conv_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub activation: Activation,
    pub fc_in_features: usize,
}

impl Default for ModelArchitecture {
    fn default() -> Self {
        Self {
            in_channels: 1,
            conv_channels: 16,
            kernel_size: 3,
            stride: 1,
            padding: 0,
            dilation: 1,
            activation: Activation::None,
            fc_in_features: 16 * 118,
        }
    }
}

impl ModelArchitecture {
    pub fn num_outputs(&self) -> usize {
        OUTPUT_LABELS.len()
    }

    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("in_channels", self.in_channels),
            ("conv_channels", self.conv_channels),
            ("kernel_size", self.kernel_size),
            ("stride", self.stride),
            ("dilation", self.dilation),
            ("fc_in_features", self.fc_in_features),
        ] {
            if value == 0 {
                return Err(Error::InvalidArchitecture(format!("{} must be positive", name)));
            }
        }
        if self.padded_length(SIGNAL_LENGTH).is_none() {
            return Err(Error::InvalidArchitecture(format!("padding {} is out of range", self.padding)));
        }
        if self.kernel_span().is_none() {
            return Err(Error::InvalidArchitecture("kernel_size and dilation span is out of range".to_string()));
        }
        Ok(())
    }

    /// Receptive field of one output sample.
    fn kernel_span(&self) -> Option<usize> {
        self.dilation.checked_mul(self.kernel_size.checked_sub(1)?)?.checked_add(1)
    }

    /// Signal length after zero padding on both sides.
    pub fn padded_length(&self, input_length: usize) -> Option<usize> {
        input_length.checked_add(self.padding.checked_mul(2)?)
    }

    /// Output length of the convolution for a signal of `input_length` samples, if it is non-empty.
    pub fn conv_output_length(&self, input_length: usize) -> Option<usize> {
        let remaining = self.padded_length(input_length)?.checked_sub(self.kernel_span()?)?;
        Some(remaining / self.stride + 1)
    }

    /// State dict keys and shapes, in the order the layers are declared.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        vec![
            ("conv.weight".to_string(), vec![self.conv_channels, self.in_channels, self.kernel_size]),
            ("conv.bias".to_string(), vec![self.conv_channels]),
            ("fc.weight".to_string(), vec![self.num_outputs(), self.fc_in_features]),
            ("fc.bias".to_string(), vec![self.num_outputs()]),
        ]
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConvertConfig {
    pub architecture: ModelArchitecture,
    /// Nested dictionary holding the parameters inside a `.pth` checkpoint, e.g. `state_dict`.
    pub state_dict_key: Option<String>,
    /// Store weights in a `.data` file next to the model instead of inside it.
    pub external_data: bool,
}

impl ConvertConfig {
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.architecture.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let json = std::fs::read_to_string(path)?;
        log::debug!("Loaded config from {}", path.display());
        Self::from_json_str(&json)
    }
}

/// Stored under [`METADATA_KEY`] in the exported model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub signal_channels: usize,
    pub signal_length: usize,
    pub batch_axis: String,
    pub outputs: Vec<String>,
    pub architecture: ModelArchitecture,
}

impl ExportMetadata {
    pub fn new(architecture: &ModelArchitecture) -> Self {
        Self {
            signal_channels: SIGNAL_CHANNELS,
            signal_length: SIGNAL_LENGTH,
            batch_axis: BATCH_AXIS.to_string(),
            outputs: OUTPUT_LABELS.iter().map(|x| x.to_string()).collect(),
            architecture: architecture.clone(),
        }
    }
}
