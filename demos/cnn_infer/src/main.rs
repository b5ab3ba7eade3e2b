// CNN inference demo: build a small network in code, compile it for the CPU
// backend, and push a batch of synthetic images through it.
//
// Architecture:
//   Conv(3->16, 3x3, pad 1) -> ReLU -> MaxPool(2x2)
//   Conv(16->32, 3x3, pad 1) -> ReLU -> MaxPool(2x2)
//   Fc(32*8*8 -> 10) -> Softmax
//
// Usage:
//   cargo run -p cnn-infer-demo
//   cargo run -p cnn-infer-demo -- --batch 8 --seed 42

use std::collections::HashMap;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stoat::prelude::*;

struct Config {
    batch: usize,
    seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self { batch: 4, seed: 0 }
    }
}

fn parse_args() -> Config {
    let mut cfg = Config::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--batch" => {
                i += 1;
                cfg.batch = args[i].parse().expect("invalid --batch");
            }
            "--seed" => {
                i += 1;
                cfg.seed = args[i].parse().expect("invalid --seed");
            }
            "--help" | "-h" => {
                println!("CNN inference demo for Stoat");
                println!();
                println!("Options:");
                println!("  --batch <n>   Images per batch (default: 4)");
                println!("  --seed <n>    Weight and input seed (default: 0)");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    cfg
}

fn uniform(rng: &mut StdRng, n: usize, fan_in: usize) -> Vec<f32> {
    let bound = (1.0 / fan_in as f32).sqrt();
    (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
}

fn build_model(rng: &mut StdRng) -> stoat::Result<ModelFile> {
    let mut parameters = HashMap::new();
    let mut param = |name: &str, dims: Vec<usize>, data: Vec<f32>| -> stoat::Result<()> {
        parameters.insert(name.to_string(), TensorBuffer::from_vec(data, dims)?);
        Ok(())
    };
    param("conv1_w", vec![16, 3, 3, 3], uniform(rng, 16 * 3 * 3 * 3, 3 * 3 * 3))?;
    param("conv1_b", vec![16], uniform(rng, 16, 3 * 3 * 3))?;
    param("conv2_w", vec![32, 16, 3, 3], uniform(rng, 32 * 16 * 3 * 3, 16 * 3 * 3))?;
    param("conv2_b", vec![32], uniform(rng, 32, 16 * 3 * 3))?;
    param("fc_w", vec![10, 32 * 8 * 8], uniform(rng, 10 * 32 * 8 * 8, 32 * 8 * 8))?;
    param("fc_b", vec![10], uniform(rng, 10, 32 * 8 * 8))?;

    Ok(ModelFile {
        graph_name: "demo_cnn".to_string(),
        parameters,
        nodes: vec![
            Node::new(OpKind::Conv, ["image", "conv1_w", "conv1_b"], ["conv1"])
                .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            Node::new(OpKind::Relu, ["conv1"], ["act1"]),
            Node::new(OpKind::MaxPool, ["act1"], ["pool1"])
                .with_attr("kernel_shape", AttrValue::Ints(vec![2, 2]))
                .with_attr("strides", AttrValue::Ints(vec![2, 2])),
            Node::new(OpKind::Conv, ["pool1", "conv2_w", "conv2_b"], ["conv2"])
                .with_attr("pads", AttrValue::Ints(vec![1, 1, 1, 1])),
            Node::new(OpKind::Relu, ["conv2"], ["act2"]),
            Node::new(OpKind::MaxPool, ["act2"], ["pool2"])
                .with_attr("kernel_shape", AttrValue::Ints(vec![2, 2]))
                .with_attr("strides", AttrValue::Ints(vec![2, 2])),
            Node::new(OpKind::Fc, ["pool2", "fc_w", "fc_b"], ["logits"]),
            Node::new(OpKind::Softmax, ["logits"], ["prob"]),
        ],
        input_names: vec!["image".to_string()],
        output_names: vec!["prob".to_string()],
    })
}

fn main() -> stoat::Result<()> {
    let cfg = parse_args();
    let mut rng = StdRng::seed_from_u64(cfg.seed);

    println!("=== Stoat: CNN inference on the CPU backend ===");
    println!();

    // 1. Build the network with randomly initialized weights.
    let model = build_model(&mut rng)?;
    let weight_count: usize = model.parameters.values().map(|b| b.elem_count()).sum();
    println!("Graph \"{}\":", model.graph_name);
    println!("  Conv(3->16, 3x3, pad 1) -> ReLU -> MaxPool(2x2)");
    println!("  Conv(16->32, 3x3, pad 1) -> ReLU -> MaxPool(2x2)");
    println!("  Fc(2048->10) -> Softmax");
    println!("  Nodes: {}   Weights: {}", model.nodes.len(), weight_count);
    println!();

    // 2. Compile for the requested batch size.
    let ctx = Context::new(CpuBackend::new());
    println!("Device: {}", ctx.device().name());
    let started = Instant::now();
    let compiled = compile(
        &ctx,
        &model,
        &[(
            "image".to_string(),
            DType::F32,
            Shape::from(vec![cfg.batch, 3, 32, 32]),
        )],
        &["prob".to_string()],
    )?;
    let compile_time = started.elapsed();

    let program = compiled.program();
    println!(
        "Compiled in {:.2?}: {} ops, {} scratch buffers",
        compile_time,
        program.op_count(),
        program.temp_count()
    );
    for node in &model.nodes {
        let n = program.ops_for(node.ident());
        if n > 0 {
            println!("  {:<8} {} op(s)", node.ident(), n);
        }
    }
    println!();

    // 3. Run a synthetic batch.
    let pixels: Vec<f32> = (0..cfg.batch * 3 * 32 * 32)
        .map(|_| rng.gen_range(0.0..1.0))
        .collect();
    compiled.bind_input("image")?.copy_from_slice(&pixels)?;

    let started = Instant::now();
    let outputs = compiled.run()?;
    let run_time = started.elapsed();
    println!("Ran a batch of {} in {:.2?}", cfg.batch, run_time);
    println!();

    // 4. Report predictions.
    println!("Predictions:");
    for (i, row) in outputs["prob"].to_vec::<f32>()?.chunks(10).enumerate() {
        let (class, p) = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        println!("  image {i}: class {class} ({:.1}%)", p * 100.0);
    }

    Ok(())
}
