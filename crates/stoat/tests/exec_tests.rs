// End-to-end compilation and execution on the CPU backend: a small CNN from
// graph to probabilities, layout negotiation visible through op counts,
// buffer identity across runs, and fault attribution.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stoat::prelude::*;

fn uniform(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
}

fn param(name: &str, data: Vec<f32>, dims: Vec<usize>) -> (String, TensorBuffer) {
    (name.to_string(), TensorBuffer::from_vec(data, dims).unwrap())
}

fn fill(compiled: &CompiledModel<CpuBackend>, name: &str, data: &[f32]) {
    compiled
        .bind_input(name)
        .unwrap()
        .copy_from_slice(data)
        .unwrap();
}

/// conv 3x3 same-pad, relu, 2x2 max pool, fully connected, softmax.
fn cnn_model(seed: u64) -> ModelFile {
    let mut rng = StdRng::seed_from_u64(seed);
    let parameters: HashMap<String, TensorBuffer> = [
        param("conv_w", uniform(&mut rng, 8 * 3 * 3 * 3, 0.5), vec![8, 3, 3, 3]),
        param("conv_b", uniform(&mut rng, 8, 0.5), vec![8]),
        param("fc_w", uniform(&mut rng, 10 * 8 * 16 * 16, 0.05), vec![10, 8 * 16 * 16]),
        param("fc_b", uniform(&mut rng, 10, 0.5), vec![10]),
    ]
    .into_iter()
    .collect();
    ModelFile {
        graph_name: "tiny_cnn".to_string(),
        parameters,
        nodes: vec![
            Node::new(OpKind::Conv, ["data", "conv_w", "conv_b"], ["conv_out"])
                .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            Node::new(OpKind::Relu, ["conv_out"], ["act"]),
            Node::new(OpKind::MaxPool, ["act"], ["pool_out"])
                .with_attr("kernel_shape", AttrValue::Ints(vec![2, 2]))
                .with_attr("strides", AttrValue::Ints(vec![2, 2])),
            Node::new(OpKind::Fc, ["pool_out", "fc_w", "fc_b"], ["fc_out"]),
            Node::new(OpKind::Softmax, ["fc_out"], ["softmax_out"]),
        ],
        input_names: vec!["data".to_string()],
        output_names: vec!["softmax_out".to_string()],
    }
}

fn cnn_inputs() -> Vec<(String, DType, Shape)> {
    vec![("data".to_string(), DType::F32, Shape::from((1, 3, 32, 32)))]
}

#[test]
fn test_cnn_pipeline_end_to_end() {
    let ctx = Context::new(CpuBackend::new());
    let model = cnn_model(7);
    let compiled = compile(&ctx, &model, &cnn_inputs(), &["softmax_out".to_string()]).unwrap();

    // Conv wants channels-last input (one reorder in), max pool wants
    // channels-first (one reorder back). Everything else runs in place, and
    // the softmax writes the requested buffer directly.
    let program = compiled.program();
    assert_eq!(program.op_count(), 7);
    assert_eq!(program.temp_count(), 2);
    assert_eq!(program.ops_for("softmax_out"), 1);
    let kinds: Vec<OpKind> = program.op_provenance().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![
            OpKind::Conv,
            OpKind::Conv,
            OpKind::Relu,
            OpKind::MaxPool,
            OpKind::MaxPool,
            OpKind::Fc,
            OpKind::Softmax,
        ]
    );

    let mut rng = StdRng::seed_from_u64(99);
    let data = uniform(&mut rng, 3 * 32 * 32, 1.0);
    fill(&compiled, "data", &data);
    let out = compiled.run().unwrap();

    assert_eq!(out.len(), 1);
    let prob = &out["softmax_out"];
    assert_eq!(prob.dims(), &[1, 10]);
    let values = prob.to_vec::<f32>().unwrap();
    let sum: f32 = values.iter().sum();
    assert!((sum - 1.0).abs() < 1e-5, "probabilities sum to {sum}");
    assert!(values.iter().all(|p| *p > 0.0 && *p < 1.0));
}

#[test]
fn test_recompilation_is_deterministic() {
    let ctx = Context::new(CpuBackend::new());
    let model = cnn_model(7);
    let want = ["softmax_out".to_string()];
    let first = compile(&ctx, &model, &cnn_inputs(), &want).unwrap();
    let second = compile(&ctx, &model, &cnn_inputs(), &want).unwrap();
    assert_eq!(first.program().op_count(), second.program().op_count());
    assert_eq!(first.program().temp_count(), second.program().temp_count());
    for (a, b) in first
        .program()
        .op_provenance()
        .zip(second.program().op_provenance())
    {
        assert_eq!(a.node, b.node);
        assert_eq!(a.kind, b.kind);
    }
}

#[test]
fn test_fc_matches_reference_matmul() {
    let mut rng = StdRng::seed_from_u64(3);
    let x = uniform(&mut rng, 8, 1.0);
    let w = uniform(&mut rng, 3 * 8, 1.0);
    let b = uniform(&mut rng, 3, 1.0);
    let model = ModelFile {
        graph_name: "fc_only".to_string(),
        parameters: [
            param("w", w.clone(), vec![3, 8]),
            param("b", b.clone(), vec![3]),
        ]
        .into_iter()
        .collect(),
        nodes: vec![Node::new(OpKind::Fc, ["x", "w", "b"], ["y"])],
        input_names: vec!["x".to_string()],
        output_names: vec!["y".to_string()],
    };

    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((1, 2, 2, 2)))],
        &["y".to_string()],
    )
    .unwrap();
    // The 4-d input is already channels-first, so no reorder is planned and
    // the trailing dims flatten straight into the feature axis.
    assert_eq!(compiled.program().op_count(), 1);

    fill(&compiled, "x", &x);
    let out = compiled.run().unwrap();
    let got = out["y"].to_vec::<f32>().unwrap();
    assert_eq!(got.len(), 3);
    for o in 0..3 {
        let mut want = b[o];
        for i in 0..8 {
            want += w[o * 8 + i] * x[i];
        }
        assert!(
            (got[o] - want).abs() < 1e-4,
            "feature {o}: got {} want {want}",
            got[o]
        );
    }
}

#[test]
fn test_batchnorm_tanh_avgpool_chain() {
    // Zero conv weights and a bias of one make every activation 1.0; the
    // normalization statistics then map it to exactly 0.5, so the whole
    // output plane must equal tanh(0.5).
    let parameters: HashMap<String, TensorBuffer> = [
        param("w", vec![0.0; 4 * 2 * 3 * 3], vec![4, 2, 3, 3]),
        param("b", vec![1.0; 4], vec![4]),
        param("scale", vec![2.0; 4], vec![4]),
        param("shift", vec![0.5; 4], vec![4]),
        param("mean", vec![1.0; 4], vec![4]),
        param("var", vec![0.75; 4], vec![4]),
    ]
    .into_iter()
    .collect();
    let model = ModelFile {
        graph_name: "bn_chain".to_string(),
        parameters,
        nodes: vec![
            Node::new(OpKind::Conv, ["data", "w", "b"], ["c"])
                .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            Node::new(OpKind::BatchNorm, ["c", "scale", "shift", "mean", "var"], ["n"])
                .with_attr("epsilon", AttrValue::Float(0.25)),
            Node::new(OpKind::Tanh, ["n"], ["t"]),
            Node::new(OpKind::AveragePool, ["t"], ["p"])
                .with_attr("kernel_shape", AttrValue::Ints(vec![2, 2]))
                .with_attr("strides", AttrValue::Ints(vec![2, 2])),
        ],
        input_names: vec!["data".to_string()],
        output_names: vec!["p".to_string()],
    };

    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("data".to_string(), DType::F32, Shape::from((1, 2, 8, 8)))],
        &["p".to_string()],
    )
    .unwrap();
    assert_eq!(compiled.program().op_count(), 6);
    assert_eq!(compiled.program().temp_count(), 2);

    fill(&compiled, "data", &vec![0.3f32; 2 * 8 * 8]);
    let out = compiled.run().unwrap();
    assert_eq!(out["p"].dims(), &[1, 4, 4, 4]);
    let want = 0.5f32.tanh();
    for v in out["p"].to_vec::<f32>().unwrap() {
        assert!((v - want).abs() < 1e-6, "got {v}, want {want}");
    }
}

#[test]
fn test_output_buffer_identity_stable_across_runs() {
    let model = ModelFile {
        graph_name: "relu_only".to_string(),
        parameters: HashMap::new(),
        nodes: vec![Node::new(OpKind::Relu, ["x"], ["y"])],
        input_names: vec!["x".to_string()],
        output_names: vec!["y".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from(vec![4usize]))],
        &["y".to_string()],
    )
    .unwrap();

    // Rebinding hands back the same input allocation every time.
    let input = compiled.bind_input("x").unwrap();
    assert!(input.ptr_eq(&compiled.bind_input("x").unwrap()));

    input.copy_from_slice(&[-1.0f32, 2.0, -3.0, 4.0]).unwrap();
    let first = compiled.run().unwrap();
    assert_eq!(first["y"].to_vec::<f32>().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);

    input.copy_from_slice(&[5.0f32, -6.0, 7.0, -8.0]).unwrap();
    let second = compiled.run().unwrap();
    assert_eq!(second["y"].to_vec::<f32>().unwrap(), vec![5.0, 0.0, 7.0, 0.0]);

    // Same output allocation across runs; a handle fetched once keeps
    // observing fresh results.
    assert!(first["y"].ptr_eq(&second["y"]));
    assert_eq!(first["y"].to_vec::<f32>().unwrap(), vec![5.0, 0.0, 7.0, 0.0]);
}

#[test]
fn test_dropout_bypassed_end_to_end() {
    let model = ModelFile {
        graph_name: "dropout_chain".to_string(),
        parameters: HashMap::new(),
        nodes: vec![
            Node::new(OpKind::Dropout, ["x"], ["d"]).with_attr("ratio", AttrValue::Float(0.5)),
            Node::new(OpKind::Relu, ["d"], ["y"]),
        ],
        input_names: vec!["x".to_string()],
        output_names: vec!["y".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((1, 2)))],
        &["y".to_string()],
    )
    .unwrap();
    // The dropout disappears at compile time; only the relu remains.
    assert_eq!(compiled.program().op_count(), 1);
    assert_eq!(compiled.program().ops_for("d"), 0);

    fill(&compiled, "x", &[-2.0f32, 3.0]);
    let out = compiled.run().unwrap();
    assert_eq!(out["y"].to_vec::<f32>().unwrap(), vec![0.0, 3.0]);
}

#[test]
fn test_unneeded_reshape_aliases_input() {
    let model = ModelFile {
        graph_name: "reshape_view".to_string(),
        parameters: HashMap::new(),
        nodes: vec![
            Node::new(OpKind::Reshape, ["x"], ["shaped"])
                .with_attr("shape", AttrValue::Ints(vec![3, 2])),
            Node::new(OpKind::Relu, ["shaped"], ["y"]),
        ],
        input_names: vec!["x".to_string()],
        output_names: vec!["y".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((2, 3)))],
        &["y".to_string()],
    )
    .unwrap();
    // The intermediate reshape is a zero-cost view over the input.
    assert_eq!(compiled.program().op_count(), 1);
    assert_eq!(compiled.program().ops_for("shaped"), 0);

    fill(&compiled, "x", &[1.0f32, -2.0, 3.0, -4.0, 5.0, -6.0]);
    let out = compiled.run().unwrap();
    assert_eq!(out["y"].dims(), &[3, 2]);
    assert_eq!(
        out["y"].to_vec::<f32>().unwrap(),
        vec![1.0, 0.0, 3.0, 0.0, 5.0, 0.0]
    );
}

#[test]
fn test_requested_reshape_copies() {
    let model = ModelFile {
        graph_name: "reshape_out".to_string(),
        parameters: HashMap::new(),
        nodes: vec![
            Node::new(OpKind::Reshape, ["x"], ["flat"])
                .with_attr("shape", AttrValue::Ints(vec![-1])),
        ],
        input_names: vec!["x".to_string()],
        output_names: vec!["flat".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((2, 3)))],
        &["flat".to_string()],
    )
    .unwrap();
    assert_eq!(compiled.program().op_count(), 1);

    let first = [1.0f32, -2.0, 3.0, -4.0, 5.0, -6.0];
    fill(&compiled, "x", &first);
    let out = compiled.run().unwrap();
    assert_eq!(out["flat"].dims(), &[6]);
    assert_eq!(out["flat"].to_vec::<f32>().unwrap(), first.to_vec());

    // The requested buffer is a copy, not a view: rebinding the input
    // without running again must leave it untouched.
    fill(&compiled, "x", &[9.0f32; 6]);
    assert_eq!(out["flat"].to_vec::<f32>().unwrap(), first.to_vec());
    let again = compiled.run().unwrap();
    assert_eq!(again["flat"].to_vec::<f32>().unwrap(), vec![9.0; 6]);
    assert!(out["flat"].ptr_eq(&again["flat"]));
}

#[test]
fn test_intermediate_output_also_requested() {
    let mut rng = StdRng::seed_from_u64(11);
    let model = ModelFile {
        graph_name: "two_outputs".to_string(),
        parameters: [
            param("w", uniform(&mut rng, 3 * 2 * 3 * 3, 0.5), vec![3, 2, 3, 3]),
            param("b", uniform(&mut rng, 3, 0.5), vec![3]),
        ]
        .into_iter()
        .collect(),
        nodes: vec![
            Node::new(OpKind::Conv, ["data", "w", "b"], ["conv_out"])
                .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            Node::new(OpKind::Relu, ["conv_out"], ["act"]),
        ],
        input_names: vec!["data".to_string()],
        output_names: vec!["act".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("data".to_string(), DType::F32, Shape::from((1, 2, 6, 6)))],
        &["conv_out".to_string(), "act".to_string()],
    )
    .unwrap();
    // Both requested values live in channels-last buffers internally, so
    // each grows a trailing reorder into its visible channels-first copy,
    // while the relu still reads the conv result without a detour.
    assert_eq!(compiled.program().op_count(), 5);
    assert_eq!(compiled.program().temp_count(), 3);

    let mut rng = StdRng::seed_from_u64(12);
    let data = uniform(&mut rng, 2 * 6 * 6, 1.0);
    fill(&compiled, "data", &data);
    let out = compiled.run().unwrap();
    assert_eq!(out.len(), 2);

    let conv = out["conv_out"].to_vec::<f32>().unwrap();
    let act = out["act"].to_vec::<f32>().unwrap();
    assert_eq!(conv.len(), 3 * 6 * 6);
    assert_eq!(act.len(), conv.len());
    for (c, a) in conv.iter().zip(&act) {
        assert_eq!(c.max(0.0), *a);
    }
}

#[test]
fn test_leaky_relu_and_elu_attributes() {
    let model = ModelFile {
        graph_name: "eltwise_pair".to_string(),
        parameters: HashMap::new(),
        nodes: vec![
            Node::new(OpKind::LeakyRelu, ["x"], ["l"])
                .with_attr("alpha", AttrValue::Float(0.5)),
            Node::new(OpKind::Elu, ["x"], ["e"]).with_attr("alpha", AttrValue::Float(2.0)),
        ],
        input_names: vec!["x".to_string()],
        output_names: vec!["l".to_string(), "e".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((1, 4)))],
        &["l".to_string(), "e".to_string()],
    )
    .unwrap();
    assert_eq!(compiled.program().op_count(), 2);

    fill(&compiled, "x", &[-2.0f32, -0.5, 0.0, 3.0]);
    let out = compiled.run().unwrap();

    assert_eq!(
        out["l"].to_vec::<f32>().unwrap(),
        vec![-1.0, -0.25, 0.0, 3.0]
    );

    let e = out["e"].to_vec::<f32>().unwrap();
    let expect = |x: f32| if x > 0.0 { x } else { 2.0 * (x.exp() - 1.0) };
    for (got, x) in e.iter().zip([-2.0f32, -0.5, 0.0, 3.0]) {
        assert!((got - expect(x)).abs() < 1e-6);
    }
}

#[test]
fn test_kernel_fault_names_the_node() {
    let model = ModelFile {
        graph_name: "faulty".to_string(),
        parameters: HashMap::new(),
        nodes: vec![
            Node::new(OpKind::Relu, ["x"], ["h"]),
            Node::new(OpKind::Softmax, ["h"], ["prob"]),
        ],
        input_names: vec!["x".to_string()],
        output_names: vec!["prob".to_string()],
    };
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(
        &ctx,
        &model,
        &[("x".to_string(), DType::F32, Shape::from((1, 4)))],
        &["prob".to_string()],
    )
    .unwrap();
    fill(&compiled, "x", &[0.0f32; 4]);

    // Poison the output buffer's lock so the softmax kernel fails at run
    // time, then check the error points at the right node.
    let poison = compiled.output("prob").unwrap().clone();
    let _ = catch_unwind(AssertUnwindSafe(move || {
        let _guard = poison.write().unwrap();
        panic!("poison the lock");
    }));

    match compiled.run().unwrap_err() {
        Error::Backend { node, op, .. } => {
            assert_eq!(node, "prob");
            assert_eq!(op, "Softmax");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_scoped_backend_survives_scope_exit() {
    let model = ModelFile {
        graph_name: "relu_only".to_string(),
        parameters: HashMap::new(),
        nodes: vec![Node::new(OpKind::Relu, ["x"], ["y"])],
        input_names: vec!["x".to_string()],
        output_names: vec!["y".to_string()],
    };
    let inputs = [("x".to_string(), DType::F32, Shape::from(vec![4usize]))];
    let want = ["y".to_string()];

    let mut ctx = Context::new(CpuBackend::new());
    let inside = {
        let scope = ctx.scoped(CpuBackend::new());
        compile(&scope, &model, &inputs, &want).unwrap()
    };

    // The compiled model snapshots its backend; leaving the scope neither
    // invalidates it nor disturbs the restored context.
    fill(&inside, "x", &[-1.0f32, 1.0, -2.0, 2.0]);
    let out = inside.run().unwrap();
    assert_eq!(out["y"].to_vec::<f32>().unwrap(), vec![0.0, 1.0, 0.0, 2.0]);

    assert_eq!(ctx.device().name(), "cpu");
    let after = compile(&ctx, &model, &inputs, &want).unwrap();
    fill(&after, "x", &[3.0f32, -3.0, 4.0, -4.0]);
    let out = after.run().unwrap();
    assert_eq!(out["y"].to_vec::<f32>().unwrap(), vec![3.0, 0.0, 4.0, 0.0]);
}
