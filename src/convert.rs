use std::io::Write;
use std::path::{Path, PathBuf};
use prost::Message;
use onnx_graph::WeightStorageStrategy;
use crate::checkpoint::Checkpoint;
use crate::config::ConvertConfig;
use crate::model::{representative_input, PpgModel};
use crate::Error;

/// Loads `checkpoint_path` into the default PPG model and exports it to `output_path`.
pub fn convert(checkpoint_path: impl AsRef<Path>, output_path: impl AsRef<Path>) -> Result<(), Error> {
    convert_with_config(checkpoint_path.as_ref(), output_path.as_ref(), &ConvertConfig::default())
}

pub fn convert_with_config(checkpoint_path: &Path, output_path: &Path, config: &ConvertConfig) -> Result<(), Error> {
    println!("Loading {}...", checkpoint_path.display());
    let mut model = PpgModel::new(config.architecture.clone())?;
    let checkpoint = Checkpoint::open(checkpoint_path, config.state_dict_key.as_deref())?;
    model.load_state_dict(checkpoint.weights())?;
    drop(checkpoint);
    let model = model.eval();

    println!("Exporting to ONNX...");
    let storage = if config.external_data {
        WeightStorageStrategy::BinFile(external_data_path(output_path))
    } else {
        WeightStorageStrategy::EmbeddedData
    };
    let result = model.to_onnx(&representative_input(), storage.clone())
        .and_then(|proto| write_atomic(output_path, &proto.encode_to_vec()));
    if let (Err(_), WeightStorageStrategy::BinFile(bin_path)) = (&result, &storage) {
        if bin_path.exists() {
            let _ = std::fs::remove_file(bin_path);
        }
    }
    result?;

    println!("Success! Saved to {}", output_path.display());
    Ok(())
}

/// `model.onnx` keeps its weights in `model.onnx.data`; never equal to `output_path`.
pub fn external_data_path(output_path: &Path) -> PathBuf {
    let mut file_name = output_path.file_name().map(|x| x.to_os_string()).unwrap_or_default();
    file_name.push(".data");
    output_path.with_file_name(file_name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
