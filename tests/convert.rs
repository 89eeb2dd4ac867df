mod common;

use ppg_onnx::config::{Activation, ConvertConfig, ExportMetadata, ModelArchitecture, INPUT_NAME, METADATA_KEY, OUTPUT_NAME};
use ppg_onnx::convert::external_data_path;
use ppg_onnx::model::PpgModel;
use ppg_onnx::onnx_graph::weights::SafetensorsWeightManager;
use ppg_onnx::reference::{DeclaredDim, ReferenceError, ReferenceModel};
use ppg_onnx::{convert, convert_with_config, Error};

#[test]
fn converts_matching_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let output = dir.path().join("ppg.onnx");

    convert(&checkpoint, &output).unwrap();

    let metadata = std::fs::metadata(&output).unwrap();
    assert!(metadata.len() > 0);
}

#[test]
fn exported_model_declares_io_contract() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let output = dir.path().join("ppg.onnx");
    convert(&checkpoint, &output).unwrap();

    let model = ReferenceModel::from_file(&output).unwrap();
    assert_eq!(model.inputs().len(), 1);
    assert_eq!(model.outputs().len(), 1);
    let input = &model.inputs()[0];
    let output_contract = &model.outputs()[0];
    assert_eq!(input.name, INPUT_NAME);
    assert_eq!(output_contract.name, OUTPUT_NAME);
    assert!(input.is_float() && output_contract.is_float());
    assert_eq!(input.dims, vec![DeclaredDim::Dynamic("batch_size".to_string()), DeclaredDim::Fixed(1), DeclaredDim::Fixed(120)]);
    assert_eq!(output_contract.dims, vec![DeclaredDim::Dynamic("batch_size".to_string()), DeclaredDim::Fixed(2)]);

    assert_eq!(model.opset_version(), Some(17));
    assert_eq!(model.producer_name(), "ppg-onnx");
    assert_eq!(model.node_types(), vec!["Conv", "Flatten", "Gemm"]);
    let metadata: ExportMetadata = serde_json::from_str(model.metadata(METADATA_KEY).unwrap()).unwrap();
    assert_eq!(metadata.outputs, vec!["sbp".to_string(), "dbp".to_string()]);
    assert_eq!(metadata.signal_length, 120);
}

#[test]
fn batch_axis_is_dynamic_and_other_axes_are_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let output = dir.path().join("ppg.onnx");
    convert(&checkpoint, &output).unwrap();
    let model = ReferenceModel::from_file(&output).unwrap();

    for batch in [1, 4, 9] {
        let y = model.run(common::signal_dyn(batch, 1, 120)).unwrap();
        assert_eq!(y.shape(), &[batch, 2]);
    }

    assert!(matches!(model.run(common::signal_dyn(1, 2, 120)), Err(ReferenceError::DimensionMismatch { axis: 1, .. })));
    assert!(matches!(model.run(common::signal_dyn(1, 1, 119)), Err(ReferenceError::DimensionMismatch { axis: 2, .. })));
}

#[test]
fn exported_graph_matches_native_forward() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let output = dir.path().join("ppg.onnx");
    convert(&checkpoint, &output).unwrap();

    let mut native = PpgModel::new(ModelArchitecture::default()).unwrap();
    native.load_state_dict(&SafetensorsWeightManager::open(&checkpoint).unwrap()).unwrap();
    let native = native.eval();

    let signal = common::signal(3, 1, 120);
    let expected = native.forward(&signal).unwrap();
    let actual = ReferenceModel::from_file(&output).unwrap().run(common::signal_dyn(3, 1, 120)).unwrap();
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-4, "{} != {}", a, e);
    }
}

#[test]
fn conversion_is_byte_for_byte_reproducible() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let first = dir.path().join("first.onnx");
    let second = dir.path().join("second.onnx");
    convert(&checkpoint, &first).unwrap();
    convert(&checkpoint, &second).unwrap();
    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
}

#[test]
fn mismatched_shapes_fail_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("wrong.safetensors");
    common::write_safetensors(&checkpoint, &[
        ("conv.weight".to_string(), vec![8, 1, 3]),
        ("conv.bias".to_string(), vec![8]),
        ("fc.weight".to_string(), vec![2, 1888]),
        ("fc.bias".to_string(), vec![2]),
    ]);
    let output = dir.path().join("ppg.onnx");

    let mismatch = match convert(&checkpoint, &output) {
        Err(Error::StateDictMismatch(mismatch)) => mismatch,
        other => panic!("unexpected result {:?}", other),
    };
    assert_eq!(mismatch.size_mismatch.len(), 2);
    assert!(!output.exists());
}

#[test]
fn missing_and_unexpected_keys_fail() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("ppg.onnx");

    let mut shapes = ModelArchitecture::default().parameter_shapes();
    shapes.retain(|(name, _)| name != "fc.bias");
    let missing = dir.path().join("missing.safetensors");
    common::write_safetensors(&missing, &shapes);
    assert!(matches!(convert(&missing, &output), Err(Error::StateDictMismatch(m)) if m.missing == vec!["fc.bias".to_string()]));

    let mut shapes = ModelArchitecture::default().parameter_shapes();
    shapes.push(("bn.running_mean".to_string(), vec![16]));
    let extra = dir.path().join("extra.safetensors");
    common::write_safetensors(&extra, &shapes);
    assert!(matches!(convert(&extra, &output), Err(Error::StateDictMismatch(m)) if m.unexpected == vec!["bn.running_mean".to_string()]));

    assert!(!output.exists());
}

#[test]
fn unreadable_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("ppg.onnx");
    let garbage = dir.path().join("garbage.pth");
    std::fs::write(&garbage, b"not a checkpoint").unwrap();
    assert!(convert(&garbage, &output).is_err());
    assert!(convert(dir.path().join("absent.pth"), &output).is_err());
    assert!(!output.exists());
}

#[test]
fn half_precision_checkpoint_exports_f32() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = dir.path().join("ppg.safetensors");
    common::write_safetensors_with_dtype(&checkpoint, &ModelArchitecture::default().parameter_shapes(), safetensors::Dtype::F16);
    let output = dir.path().join("ppg.onnx");
    convert(&checkpoint, &output).unwrap();

    let model = ReferenceModel::from_file(&output).unwrap();
    let weight = model.initializer("conv.weight").unwrap();
    assert_eq!(weight.shape(), &[16, 1, 3]);
    let expected = half::f16::from_f32(common::parameter_values(0, 2)[1]).to_f32();
    assert_ne!(expected, 0.0);
    assert_eq!(weight.iter().nth(1).copied(), Some(expected));
}

#[test]
fn external_data_matches_embedded_weights() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let embedded = dir.path().join("embedded.onnx");
    let external = dir.path().join("external.onnx");
    convert(&checkpoint, &embedded).unwrap();
    let config = ConvertConfig { external_data: true, ..Default::default() };
    convert_with_config(&checkpoint, &external, &config).unwrap();

    let bin = external_data_path(&external);
    assert!(bin.exists());
    assert!(std::fs::metadata(&external).unwrap().len() < std::fs::metadata(&embedded).unwrap().len());

    let signal = common::signal_dyn(2, 1, 120);
    let a = ReferenceModel::from_file(&embedded).unwrap().run(signal.clone()).unwrap();
    let b = ReferenceModel::from_file(&external).unwrap().run(signal).unwrap();
    assert_eq!(a, b);

    let bytes = std::fs::read(&external).unwrap();
    assert!(matches!(ReferenceModel::from_bytes(&bytes, None), Err(ReferenceError::InvalidExternalData(_))));
}

#[test]
fn external_data_never_overwrites_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = common::write_checkpoint(dir.path(), &ModelArchitecture::default());
    let embedded = dir.path().join("embedded.onnx");
    convert(&checkpoint, &embedded).unwrap();

    let config = ConvertConfig { external_data: true, ..Default::default() };
    for name in ["ppg.bin", "ppg.data"] {
        let output = dir.path().join(name);
        convert_with_config(&checkpoint, &output, &config).unwrap();
        assert_ne!(external_data_path(&output), output);
        assert!(external_data_path(&output).exists());

        let signal = common::signal_dyn(2, 1, 120);
        let expected = ReferenceModel::from_file(&embedded).unwrap().run(signal.clone()).unwrap();
        let actual = ReferenceModel::from_file(&output).unwrap().run(signal).unwrap();
        assert_eq!(actual, expected);
    }
}

#[test]
fn configured_architecture_exports_relu() {
    let dir = tempfile::tempdir().unwrap();
    let architecture = ModelArchitecture {
        conv_channels: 8,
        kernel_size: 5,
        padding: 2,
        activation: Activation::Relu,
        fc_in_features: 8 * 120,
        ..Default::default()
    };
    let checkpoint = common::write_checkpoint(dir.path(), &architecture);
    let config_path = dir.path().join("arch.json");
    std::fs::write(&config_path, serde_json::to_string(&ConvertConfig { architecture: architecture.clone(), ..Default::default() }).unwrap()).unwrap();
    let config = ConvertConfig::from_json_file(&config_path).unwrap();
    let output = dir.path().join("ppg.onnx");
    convert_with_config(&checkpoint, &output, &config).unwrap();

    let model = ReferenceModel::from_file(&output).unwrap();
    assert_eq!(model.node_types(), vec!["Conv", "Relu", "Flatten", "Gemm"]);

    let mut native = PpgModel::new(architecture).unwrap();
    native.load_state_dict(&SafetensorsWeightManager::open(&checkpoint).unwrap()).unwrap();
    let expected = native.eval().forward(&common::signal(2, 1, 120)).unwrap();
    let actual = model.run(common::signal_dyn(2, 1, 120)).unwrap();
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-4, "{} != {}", a, e);
    }
}

#[test]
fn architecture_rejecting_the_representative_input_fails_at_trace() {
    let dir = tempfile::tempdir().unwrap();
    let architecture = ModelArchitecture { in_channels: 2, ..Default::default() };
    let checkpoint = common::write_checkpoint(dir.path(), &architecture);
    let output = dir.path().join("ppg.onnx");
    let config = ConvertConfig { architecture, ..Default::default() };
    assert!(matches!(convert_with_config(&checkpoint, &output, &config), Err(Error::TraceError { .. })));
    assert!(!output.exists());
}
