//! Serialization round trips of fused and quantized models.

mod common;

use sgfuse_exec::ReferenceExecutor;
use sgfuse_ir::{BatchNormParams, ComputeGraph, ConvParams, FcParams, Scalar, TensorShape};
use sgfuse_opt::{QuantizeConfig, quantize_model};
use sgfuse_proto::{ProtoError, decode_model, encode_model, load_model, save_model};

fn small_net() -> ComputeGraph {
    let mut g = ComputeGraph::new();
    let x = g
        .add_input("data", Scalar::F32, TensorShape::fixed(&[1, 3, 6, 6]))
        .unwrap();
    let c = g
        .convolution("conv", x, None, ConvParams::new([3, 3], 4).with_pad([1, 1]))
        .unwrap();
    let bn = g.batch_norm("bn", c, BatchNormParams::default()).unwrap();
    let r = g.relu("relu", bn).unwrap();
    let fc = g.fully_connected("fc", r, None, FcParams::new(5)).unwrap();
    let out = g.relu("fc_relu", fc).unwrap();
    g.set_outputs(vec![out]);
    g
}

fn assert_same_attributes(a: &ComputeGraph, b: &ComputeGraph) {
    assert_eq!(a.node_count(), b.node_count());
    for node in &a.nodes {
        let other = b
            .node_by_name(&node.name)
            .unwrap_or_else(|| panic!("{} missing after round trip", node.name));
        assert_eq!(a.attributes(node), b.attributes(other), "{}", node.name);
        assert_eq!(node.op, other.op);
    }
}

#[test]
fn fused_model_roundtrip() {
    let graph = small_net();
    let fused = common::fuse(&graph);
    let params = common::random_params(&graph, 1);

    let bytes = encode_model(&fused, &params).unwrap();
    let (decoded, decoded_params) = decode_model(&bytes).unwrap();
    assert_same_attributes(&fused, &decoded);
    assert_eq!(decoded_params, params);

    let feeds = common::random_feeds(&graph, 2);
    common::assert_same_outputs(&fused, &decoded, &params, &decoded_params, &feeds, 0.0, 0.0);
}

#[test]
fn quantized_model_roundtrip() {
    let graph = small_net();
    let fused = common::fuse(&graph);
    let params = common::random_params(&graph, 1);
    let dataset = common::calib_dataset(&graph, 4, 10);
    let model = quantize_model(
        &fused,
        &params,
        &ReferenceExecutor,
        &dataset,
        &QuantizeConfig::default(),
    )
    .unwrap();

    let bytes = encode_model(&model.graph, &model.params).unwrap();
    let (decoded, decoded_params) = decode_model(&bytes).unwrap();
    assert_same_attributes(&model.graph, &decoded);
    assert_eq!(decoded_params, model.params);
    assert!(decoded_params.get("conv_weight").unwrap().is_quantized());

    let feeds = &dataset.batches[0];
    common::assert_same_outputs(
        &model.graph,
        &decoded,
        &model.params,
        &decoded_params,
        feeds,
        0.0,
        0.0,
    );
}

#[test]
fn save_then_load() {
    let graph = common::fuse(&small_net());
    let params = common::random_params(&small_net(), 4);
    let dir = std::env::temp_dir().join(format!("sgfuse-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("net.sgfuse");

    save_model(&path, &graph, &params).unwrap();
    let (loaded, loaded_params) = load_model(&path).unwrap();
    std::fs::remove_dir_all(&dir).ok();

    assert_same_attributes(&graph, &loaded);
    assert_eq!(loaded_params, params);
}

#[test]
fn truncated_model_is_rejected() {
    let graph = common::fuse(&small_net());
    let params = common::random_params(&small_net(), 4);
    let bytes = encode_model(&graph, &params).unwrap();
    for cut in [1, bytes.len() / 3, bytes.len() - 1] {
        let result = decode_model(&bytes[..cut]);
        assert!(result.is_err(), "decoding {cut} of {} bytes succeeded", bytes.len());
    }
    assert!(matches!(
        decode_model(b"not a model"),
        Err(ProtoError::Decode(_) | ProtoError::UnsupportedVersion(_) | ProtoError::MissingGraph)
    ));
}
