use std::path::{Path, PathBuf};
use clap::Parser;
use crate::config::ConvertConfig;
use crate::Error;

pub const USAGE: &str = "Usage: convert <input.pth> <output.onnx>";

#[derive(Parser, Debug)]
#[command(name = "convert", version, about = "Convert a PPG model checkpoint to ONNX")]
pub struct Cli {
    /// Checkpoint to load (.pth, .pt or .safetensors)
    pub input: Option<PathBuf>,

    /// Destination of the exported model
    pub output: Option<PathBuf>,

    /// Further positional arguments are accepted and ignored
    #[arg(hide = true)]
    pub extra: Vec<String>,

    /// JSON file describing the architecture and export options
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write weights to a .data file next to the model
    #[arg(long)]
    pub external_data: bool,

    /// Nested dictionary holding the parameters, e.g. state_dict
    #[arg(long)]
    pub state_dict_key: Option<String>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Both paths, or `None` when either positional argument is missing.
    pub fn paths(&self) -> Option<(&Path, &Path)> {
        Some((self.input.as_deref()?, self.output.as_deref()?))
    }

    /// The config file if given, with command line flags layered on top.
    pub fn convert_config(&self) -> Result<ConvertConfig, Error> {
        let mut config = match &self.config {
            Some(path) => ConvertConfig::from_json_file(path)?,
            None => ConvertConfig::default(),
        };
        if self.external_data {
            config.external_data = true;
        }
        if let Some(key) = &self.state_dict_key {
            config.state_dict_key = Some(key.clone());
        }
        Ok(config)
    }
}

pub fn run(cli: &Cli) -> Result<(), Error> {
    let Some((input, output)) = cli.paths() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if !cli.extra.is_empty() {
        log::warn!("Ignoring extra arguments {:?}", cli.extra);
    }
    let config = cli.convert_config()?;
    log::debug!("{:?}", config);
    crate::convert_with_config(input, output, &config)
}
