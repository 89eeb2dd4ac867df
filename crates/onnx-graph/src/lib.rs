pub mod operators;
pub mod weights;
pub mod tensor;
pub mod node;
pub mod pytorch;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tensor::*;
use node::*;

pub mod onnx {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

use crate::weights::{BinOutputManager, EmbeddedOutputManager, WeightExternalOutputManager};

/// IR version 8 is the newest one understood by runtimes supporting opset 17.
pub const IR_VERSION: i64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Incompatible input shapes for {0}")]
    InputShapeError(&'static str),
    #[error("DType mismatch between operator inputs")]
    DTypeMismatchError,
    #[error("Invalid operator input")]
    InvalidInputError,
    #[error("Unsupported dtype")]
    UnsupportedDTypeError,
    #[error("Invalid dtype for operator")]
    InvalidDTypeError,
    #[error("Tensor name \"{0}\" is used more than once")]
    NameConflictError(String),
    #[error("No such tensor: {0}")]
    NoSuchTensorError(String),
    #[error("Dimension has no concrete value")]
    UnresolvedDimensionError,
    #[error("Weight data requested before the weight file was finalized")]
    WeightsNotFinalizedError,
    #[error("Invalid path: {0}")]
    InvalidPathError(PathBuf),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    CandleCoreError(#[from] candle_core::Error),
    #[error(transparent)]
    SafeTensorError(#[from] safetensors::SafeTensorError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WeightStorageStrategy {
    EmbeddedData,
    BinFile(PathBuf)
}

/// Model-level fields of the exported `ModelProto`.
#[derive(Clone, Debug, Default)]
pub struct ModelHeader {
    pub producer_name: String,
    pub producer_version: String,
    pub opset_version: i64,
    pub doc_string: String,
    pub metadata_props: Vec<(String, String)>
}

#[derive(Default)]
struct GraphWalk<'a> {
    nodes: Vec<&'a dyn Node>,
    tensors: Vec<&'a dyn Tensor>,
    seen_nodes: HashSet<&'a dyn Node>,
    seen_tensors: HashSet<&'a dyn Tensor>,
}

impl<'a> GraphWalk<'a> {
    // Post-order, so every node lands after the producers of its inputs.
    fn visit(&mut self, tensor: &'a dyn Tensor) {
        if !self.seen_tensors.insert(tensor) {
            return;
        }
        if let Some(node) = tensor.get_node() {
            if self.seen_nodes.insert(node) {
                for input in node.get_input_tensors() {
                    self.visit(input);
                }
                self.nodes.push(node);
            }
        }
        self.tensors.push(tensor);
    }
}

pub fn build_proto(
    inputs: &[Arc<dyn Tensor>],
    outputs: &[(String, Arc<dyn Tensor>)],
    output_method: WeightStorageStrategy,
    header: &ModelHeader,
) -> Result<onnx::ModelProto, Error> {
    let mut walk = GraphWalk::default();
    for (_, tensor) in outputs {
        walk.visit(tensor.as_ref());
    }
    let GraphWalk { nodes, tensors, .. } = walk;

    let is_output = |tensor: &dyn Tensor| outputs.iter().any(|(_, t)| (t.as_ref() as &dyn Tensor) == tensor);

    // Assign names: requested names, then output names, then generated ones
    let mut chosen_names: HashSet<String> = HashSet::new();
    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    for tensor in &tensors {
        if is_output(*tensor) {
            continue;
        }
        if let Some(name) = tensor.get_name() {
            if !chosen_names.insert(name.to_string()) {
                return Err(Error::NameConflictError(name.to_string()));
            }
            tensor_names.insert(*tensor, name.to_string());
        }
    }
    for (name, tensor) in outputs {
        if !chosen_names.insert(name.clone()) {
            return Err(Error::NameConflictError(name.clone()));
        }
        tensor_names.insert(tensor.as_ref(), name.clone());
    }
    let mut next_tensor_id = 0;
    for tensor in &tensors {
        if !tensor_names.contains_key(tensor) {
            let name = loop {
                let name = format!("tensor_{}", next_tensor_id);
                next_tensor_id += 1;
                if !chosen_names.contains(&name) {
                    break name;
                }
            };
            chosen_names.insert(name.clone());
            tensor_names.insert(*tensor, name);
        }
    }

    for input in inputs {
        if !tensor_names.contains_key(&(input.as_ref() as &dyn Tensor)) {
            log::warn!("Graph input {:?} is not used by any output", input.get_name());
        }
    }

    // Gather tensor weights
    let mut data_manager: Box<dyn WeightExternalOutputManager> = match &output_method {
        WeightStorageStrategy::EmbeddedData => Box::new(EmbeddedOutputManager::new()),
        WeightStorageStrategy::BinFile(path) => Box::new(BinOutputManager::new(path)?),
    };
    for tensor in &tensors {
        tensor.gather_weights(data_manager.as_mut())?;
    }
    data_manager.finalize_tensor_data()?;

    let mut initializers = vec![];
    for tensor in &tensors {
        if let Some(initializer) = tensor.get_initializer(tensor_names[tensor].clone(), data_manager.as_mut())? {
            initializers.push(initializer);
        }
    }
    log::debug!("Graph has {} nodes, {} tensors, {} initializers", nodes.len(), tensors.len(), initializers.len());

    // Intermediate values get shape annotations
    let value_info = tensors.iter()
        .filter(|tensor| tensor.get_node().is_some() && !is_output(**tensor))
        .map(|tensor| tensor.to_value_info_proto(tensor_names[tensor].clone()))
        .collect();

    let mut node_protos = vec![];
    for (i, node) in nodes.iter().enumerate() {
        let name = match node.get_name() {
            Some(name) => name.to_string(),
            None => format!("{}_{}", node.get_onnx_type(), i),
        };
        node_protos.push(node.to_node_proto(name, &tensor_names));
    }

    let graph = onnx::GraphProto {
        name: "main_graph".to_string(),
        node: node_protos,
        initializer: initializers,
        input: inputs.iter().map(|tensor| {
            let name = tensor_names.get(&(tensor.as_ref() as &dyn Tensor)).cloned()
                .or_else(|| tensor.get_name().map(|x| x.to_string()))
                .unwrap_or_default();
            tensor.to_value_info_proto(name)
        }).collect(),
        output: outputs.iter().map(|(name, tensor)| tensor.to_value_info_proto(name.to_string())).collect(),
        value_info,
        .. Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: header.opset_version,
        }],
        producer_name: header.producer_name.clone(),
        producer_version: header.producer_version.clone(),
        doc_string: header.doc_string.clone(),
        graph: Some(graph),
        metadata_props: header.metadata_props.iter().map(|(key, value)| onnx::StringStringEntryProto {
            key: key.clone(),
            value: value.clone(),
        }).collect(),
        .. Default::default()
    })
}
