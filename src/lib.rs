pub mod config;
pub mod model;
pub mod checkpoint;
pub mod convert;
pub mod reference;
pub mod cli;

use std::fmt;

pub use onnx_graph;
pub use convert::{convert, convert_with_config};

/// Differences between a checkpoint's parameters and the ones the model declares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDictMismatch {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    /// `(name, checkpoint shape, model shape)`
    pub size_mismatch: Vec<(String, Vec<usize>, Vec<usize>)>
}

impl StateDictMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.size_mismatch.is_empty()
    }
}

impl fmt::Display for StateDictMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error(s) in loading state_dict:")?;
        if !self.missing.is_empty() {
            write!(f, " Missing key(s): {}.", quoted_list(&self.missing))?;
        }
        if !self.unexpected.is_empty() {
            write!(f, " Unexpected key(s): {}.", quoted_list(&self.unexpected))?;
        }
        for (name, found, expected) in &self.size_mismatch {
            write!(f, " size mismatch for {}: copying a param with shape {:?} from checkpoint, the shape in current model is {:?}.", name, found, expected)?;
        }
        Ok(())
    }
}

fn quoted_list(names: &[String]) -> String {
    names.iter().map(|x| format!("\"{}\"", x)).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    StateDictMismatch(StateDictMismatch),
    #[error("Representative input of shape {actual:?} does not fit the model: {reason}")]
    TraceError {
        actual: Vec<usize>,
        reason: String
    },
    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error(transparent)]
    GraphError(#[from] onnx_graph::Error),
    #[error(transparent)]
    ReferenceError(#[from] reference::ReferenceError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_message_lists_every_problem() {
        let mismatch = StateDictMismatch {
            missing: vec!["fc.bias".to_string()],
            unexpected: vec!["head.weight".to_string()],
            size_mismatch: vec![("conv.weight".to_string(), vec![8, 1, 3], vec![16, 1, 3])],
        };
        let message = Error::StateDictMismatch(mismatch).to_string();
        assert!(message.contains("Missing key(s): \"fc.bias\"."));
        assert!(message.contains("Unexpected key(s): \"head.weight\"."));
        assert!(message.contains("size mismatch for conv.weight: copying a param with shape [8, 1, 3]"));
        assert!(StateDictMismatch::default().is_empty());
    }
}
