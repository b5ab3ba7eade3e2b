// Inspect an ONNX model: decode it, summarize the graph, and preview the
// staged execution plan the compiler would schedule for it.
//
// Usage:
//   cargo run -p onnx-summary-demo -- model.onnx
//   cargo run -p onnx-summary-demo -- model.onnx --input image=1x3x224x224
//   cargo run -p onnx-summary-demo -- model.onnx --output prob

use std::collections::{BTreeMap, HashMap, HashSet};

use stoat::graph::{bypass_dropout, bypass_reshape_before_fc, prune_and_stage};
use stoat::prelude::*;

struct Config {
    path: String,
    input_shapes: Vec<(String, Shape)>,
    outputs: Vec<String>,
}

fn parse_dims(raw: &str) -> Shape {
    let dims: Vec<usize> = raw
        .split('x')
        .map(|d| d.parse().expect("invalid dimension in --input"))
        .collect();
    Shape::from(dims)
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut path = None;
    let mut input_shapes = Vec::new();
    let mut outputs = Vec::new();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                i += 1;
                let (name, dims) = args[i]
                    .split_once('=')
                    .expect("--input wants name=DIMS, e.g. image=1x3x224x224");
                input_shapes.push((name.to_string(), parse_dims(dims)));
            }
            "--output" => {
                i += 1;
                outputs.push(args[i].clone());
            }
            "--help" | "-h" => {
                println!("ONNX model summary for Stoat");
                println!();
                println!("Usage: onnx_summary <model.onnx> [options]");
                println!();
                println!("Options:");
                println!("  --input <name=DIMS>   Declared input shape, e.g. image=1x3x224x224.");
                println!("                        With every input shaped, the plan is compiled.");
                println!("  --output <name>       Value to schedule for (default: the model's outputs)");
                std::process::exit(0);
            }
            other if path.is_none() && !other.starts_with('-') => {
                path = Some(other.to_string());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    let path = path.unwrap_or_else(|| {
        eprintln!("Usage: onnx_summary <model.onnx> [--input name=DIMS] [--output name]");
        std::process::exit(1)
    });
    Config {
        path,
        input_shapes,
        outputs,
    }
}

fn main() -> stoat::Result<()> {
    let cfg = parse_args();

    // 1. Decode the file.
    let model = ModelFile::from_path(&cfg.path)?;
    let graph_name = if model.graph_name.is_empty() {
        "<unnamed>"
    } else {
        &model.graph_name
    };
    println!("{}: graph \"{graph_name}\"", cfg.path);

    let weight_count: usize = model.parameters.values().map(|b| b.elem_count()).sum();
    println!(
        "  {} nodes, {} parameters ({} values), {} inputs, {} outputs",
        model.nodes.len(),
        model.parameters.len(),
        weight_count,
        model.input_names.len(),
        model.output_names.len()
    );

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &model.nodes {
        *by_kind.entry(node.kind().as_str()).or_insert(0) += 1;
    }
    let kinds: Vec<String> = by_kind.iter().map(|(k, n)| format!("{k} x{n}")).collect();
    println!("  ops: {}", kinds.join(", "));

    for name in &model.input_names {
        println!("  input  {name}");
    }
    for name in &model.output_names {
        println!("  output {name}");
    }
    println!();

    // 2. Schedule, with the same simplification passes the compiler runs.
    let want: Vec<String> = if cfg.outputs.is_empty() {
        model.output_names.clone()
    } else {
        cfg.outputs.clone()
    };
    if want.is_empty() {
        return Err(Error::msg(
            "the model declares no outputs; pass --output <name>",
        ));
    }

    let mut nodes = model.nodes.clone();
    bypass_dropout(&mut nodes);
    bypass_reshape_before_fc(&mut nodes);
    let parameter_names: HashSet<String> = model.parameters.keys().cloned().collect();
    let graph = prune_and_stage(nodes, &want, &model.input_names, &parameter_names)?;

    println!(
        "Plan for [{}]: {} of {} nodes in {} stages",
        want.join(", "),
        graph.staged_node_count(),
        model.nodes.len(),
        graph.stages().len()
    );
    for (i, stage) in graph.stages().iter().enumerate() {
        let names: Vec<String> = stage
            .iter()
            .map(|&id| {
                let node = graph.node(id);
                format!("{} ({})", node.ident(), node.kind())
            })
            .collect();
        println!("  stage {i}: {}", names.join("  "));
    }
    println!();

    // 3. Compile once every declared input has a concrete shape.
    let shaped: HashMap<&str, &Shape> = cfg
        .input_shapes
        .iter()
        .map(|(n, s)| (n.as_str(), s))
        .collect();
    let missing: Vec<&str> = model
        .input_names
        .iter()
        .map(String::as_str)
        .filter(|n| !shaped.contains_key(n))
        .collect();
    if !missing.is_empty() {
        println!(
            "Pass --input <name=DIMS> for {} to compile the plan.",
            missing.join(", ")
        );
        return Ok(());
    }

    let inputs: Vec<(String, DType, Shape)> = cfg
        .input_shapes
        .iter()
        .map(|(n, s)| (n.clone(), DType::F32, s.clone()))
        .collect();
    let ctx = Context::new(CpuBackend::new());
    let compiled = compile(&ctx, &model, &inputs, &want)?;
    let program = compiled.program();
    println!(
        "Compiled for {}: {} ops, {} scratch buffers",
        ctx.device().name(),
        program.op_count(),
        program.temp_count()
    );
    let mut last = "";
    for meta in program.op_provenance() {
        if meta.node != last {
            println!(
                "  {} ({}): {} op(s)",
                meta.node,
                meta.kind,
                program.ops_for(&meta.node)
            );
            last = &meta.node;
        }
    }
    for (name, buf) in compiled.outputs() {
        println!("  output {name}: {} {}", buf.dtype(), buf.shape());
    }

    Ok(())
}
