use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sgfuse_exec::{Executor, Feeds, ParamSet, ReferenceExecutor, Tensor};
use sgfuse_ir::{ComputeGraph, FusedConvParams, OpKind};
use sgfuse_opt::{CalibrationDataset, FusionConfig, OperatorFusion};

/// Random values for every declared parameter. Batch-norm variances are
/// kept positive.
#[allow(dead_code)]
pub fn random_params(graph: &ComputeGraph, seed: u64) -> ParamSet {
    let mut rng = StdRng::seed_from_u64(seed);
    graph
        .params
        .iter()
        .map(|&e| {
            let info = graph.edge(e).expect("param edge");
            let shape = info.shape.to_fixed().expect("params must have fixed shapes");
            let positive = info.name.ends_with("moving_var");
            let values = ArrayD::from_shape_simple_fn(shape, || {
                if positive {
                    rng.gen_range(0.5f32..1.5)
                } else {
                    rng.gen_range(-1.0f32..1.0)
                }
            });
            (info.name.clone(), Tensor::Float(values))
        })
        .collect()
}

/// Uniform `[-1, 1)` values for every graph input.
#[allow(dead_code)]
pub fn random_feeds(graph: &ComputeGraph, seed: u64) -> Feeds {
    let mut rng = StdRng::seed_from_u64(seed);
    graph
        .inputs
        .iter()
        .map(|&e| {
            let info = graph.edge(e).expect("input edge");
            let shape = info.shape.to_fixed().expect("inputs must have fixed shapes");
            let values = ArrayD::from_shape_simple_fn(shape, || rng.gen_range(-1.0f32..1.0));
            (info.name.clone(), values)
        })
        .collect()
}

/// `batches` random feed maps drawn from the same distribution as
/// [`random_feeds`].
#[allow(dead_code)]
pub fn calib_dataset(graph: &ComputeGraph, batches: usize, seed: u64) -> CalibrationDataset {
    CalibrationDataset::from_batches(
        (0..batches)
            .map(|i| random_feeds(graph, seed + i as u64))
            .collect(),
    )
}

/// Run `graph` with the reference executor and return float outputs.
#[allow(dead_code)]
pub fn run(graph: &ComputeGraph, params: &ParamSet, feeds: &Feeds) -> Vec<ArrayD<f32>> {
    ReferenceExecutor
        .run(graph, params, feeds)
        .expect("execution failed")
        .iter()
        .map(|t| t.to_f32().into_owned())
        .collect()
}

/// Fuse with the default configuration.
#[allow(dead_code)]
pub fn fuse(graph: &ComputeGraph) -> ComputeGraph {
    OperatorFusion::new(FusionConfig::default())
        .fuse(graph)
        .expect("fusion failed")
}

/// Parameters of the fused conv node named `name`.
#[allow(dead_code)]
pub fn fused_conv<'a>(graph: &'a ComputeGraph, name: &str) -> &'a FusedConvParams {
    let node = graph
        .node_by_name(name)
        .unwrap_or_else(|| panic!("no node named {name}"));
    match &node.op {
        OpKind::FusedConv(p) => p,
        other => panic!("{name} is {other:?}, expected a fused conv"),
    }
}

/// Element-wise `|a - b| <= atol + rtol * |b|`.
#[allow(dead_code)]
pub fn assert_allclose(actual: &ArrayD<f32>, expected: &ArrayD<f32>, rtol: f32, atol: f32) {
    assert_eq!(actual.shape(), expected.shape(), "shape mismatch");
    for (i, (a, b)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - b).abs() <= atol + rtol * b.abs(),
            "mismatch at flat index {i}: {a} vs {b} (rtol={rtol}, atol={atol})"
        );
    }
}

/// Run both graphs on the same data and compare every output.
#[allow(dead_code)]
pub fn assert_same_outputs(
    reference: &ComputeGraph,
    candidate: &ComputeGraph,
    params: &ParamSet,
    candidate_params: &ParamSet,
    feeds: &Feeds,
    rtol: f32,
    atol: f32,
) {
    let want = run(reference, params, feeds);
    let got = run(candidate, candidate_params, feeds);
    assert_eq!(want.len(), got.len(), "output count differs");
    for (g, w) in got.iter().zip(&want) {
        assert_allclose(g, w, rtol, atol);
    }
}
