// Program assembly and execution
//
// `compile` runs the whole pipeline: simplification passes over the node
// list, prune-and-stage, then a single in-order walk that infers each
// node's output shape, plans its ops, and threads buffer bindings forward.
// The result owns every buffer its ops reference, so a compiled model can
// outlive the model file and the context it was built from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stoat_core::{Backend, DType, Error, Layout, OpKind, Result, Shape, TensorBuffer};

use super::plan::plan_node;
use crate::context::Context;
use crate::graph;
use crate::infer;
use crate::onnx::ModelFile;

/// Provenance of one submitted op: the node it was planned for and that
/// node's kind. Run-time faults are mapped through this back to a node.
#[derive(Debug, Clone)]
pub struct OpMeta {
    pub node: String,
    pub kind: OpKind,
}

/// The flat op list with the buffers it reads and writes.
///
/// Ops hold handles on their buffers, so the program keeps every input,
/// parameter, intermediate, and output allocation alive for as long as it
/// exists. Buffers are reused across runs; nothing is allocated at run time.
pub struct Program<B: Backend> {
    ops: Vec<B::Op>,
    meta: Vec<OpMeta>,
    inputs: Vec<(String, TensorBuffer)>,
    outputs: Vec<(String, TensorBuffer)>,
    temps: usize,
}

impl<B: Backend> Program<B> {
    /// Ops submitted per run, kernels and layout conversions alike.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Scratch buffers allocated for layout staging.
    pub fn temp_count(&self) -> usize {
        self.temps
    }

    /// Which node each op position belongs to, in submission order.
    pub fn op_provenance(&self) -> impl Iterator<Item = &OpMeta> {
        self.meta.iter()
    }

    /// How many ops one node contributed.
    pub fn ops_for(&self, node: &str) -> usize {
        self.meta.iter().filter(|m| m.node == node).count()
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(name, _)| name.as_str())
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }
}

/// A program bound to the backend it was compiled against.
pub struct CompiledModel<B: Backend> {
    backend: Arc<B>,
    program: Program<B>,
}

impl<B: Backend> CompiledModel<B> {
    /// The writable buffer behind one declared input. The same allocation
    /// is handed back for the model's whole lifetime; refill it with
    /// `copy_from_slice` between runs.
    pub fn bind_input(&self, name: &str) -> Result<TensorBuffer> {
        self.program
            .inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, buf)| buf.clone())
            .ok_or_else(|| Error::MissingValue {
                name: name.to_string(),
            })
    }

    /// Execute the whole program in one blocking submit and hand back the
    /// requested outputs, each in natural layout.
    ///
    /// The first faulting op aborts the run; the error names the node the
    /// op was planned for and no outputs are returned. On success the map
    /// holds the same buffer allocations run after run; each run rewrites
    /// their contents in place.
    pub fn run(&self) -> Result<HashMap<String, TensorBuffer>> {
        self.backend.submit(&self.program.ops).map_err(|fault| {
            let (node, op) = match self.program.meta.get(fault.index) {
                Some(m) => (m.node.clone(), m.kind.to_string()),
                None => (String::new(), String::new()),
            };
            Error::Backend {
                node,
                op,
                msg: fault.msg,
            }
        })?;
        Ok(self
            .program
            .outputs
            .iter()
            .map(|(name, buf)| (name.clone(), buf.clone()))
            .collect())
    }

    /// A requested output's buffer in natural layout. The same allocation
    /// is returned for the model's whole lifetime; each run overwrites its
    /// contents in place.
    pub fn output(&self, name: &str) -> Option<&TensorBuffer> {
        self.program
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, buf)| buf)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &TensorBuffer)> {
        self.program.outputs.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn program(&self) -> &Program<B> {
        &self.program
    }
}

/// Compile `model` for the context's backend.
///
/// `inputs` declares the values the caller will bind before each run;
/// `outputs` names the values the caller wants back. Only the subgraph the
/// outputs need is compiled.
pub fn compile<B: Backend>(
    context: &Context<B>,
    model: &ModelFile,
    inputs: &[(String, DType, Shape)],
    outputs: &[String],
) -> Result<CompiledModel<B>> {
    let backend = context.backend_arc();

    let mut nodes = model.nodes.clone();
    graph::bypass_dropout(&mut nodes);
    graph::bypass_reshape_before_fc(&mut nodes);

    let declared: Vec<String> = inputs.iter().map(|(name, _, _)| name.clone()).collect();
    let parameter_names: HashSet<String> = model.parameters.keys().cloned().collect();
    let graph = graph::prune_and_stage(nodes, outputs, &declared, &parameter_names)?;

    // Seed shapes and bindings with everything external. A declared input
    // wins over a parameter of the same name.
    let mut shapes: HashMap<String, Shape> = HashMap::new();
    let mut bindings: HashMap<String, TensorBuffer> = HashMap::new();
    for (name, buf) in &model.parameters {
        shapes.insert(name.clone(), buf.shape().clone());
        bindings.insert(name.clone(), buf.clone());
    }
    let mut input_bufs: Vec<(String, TensorBuffer)> = Vec::new();
    for (name, dtype, shape) in inputs {
        let buf = TensorBuffer::zeros(*dtype, shape.clone(), Layout::natural_for(shape))?;
        shapes.insert(name.clone(), shape.clone());
        bindings.insert(name.clone(), buf.clone());
        input_bufs.push((name.clone(), buf));
    }

    let requested: HashSet<&str> = outputs.iter().map(String::as_str).collect();
    let mut ops: Vec<B::Op> = Vec::new();
    let mut meta: Vec<OpMeta> = Vec::new();
    let mut visible: HashMap<String, TensorBuffer> = HashMap::new();
    let mut temps = 0;
    for stage in graph.stages() {
        for &id in stage {
            let node = graph.node(id);
            let out_shape = infer::infer_output_shape(node, &shapes)?;
            let required = requested.contains(node.output());
            let plan = plan_node(backend.as_ref(), node, &bindings, &out_shape, required)?;
            for _ in 0..plan.ops.len() {
                meta.push(OpMeta {
                    node: node.ident().to_string(),
                    kind: node.kind(),
                });
            }
            ops.extend(plan.ops);
            temps += plan.temps;
            shapes.insert(node.output().to_string(), out_shape);
            bindings.insert(node.output().to_string(), plan.binding);
            if let Some(buf) = plan.visible {
                visible.insert(node.output().to_string(), buf);
            }
        }
    }

    let mut output_bufs: Vec<(String, TensorBuffer)> = Vec::new();
    for name in outputs {
        let buf = match visible.get(name) {
            Some(buf) => buf.clone(),
            // A requested name no node produces is an externally bound
            // value echoed back.
            None => bindings.get(name).cloned().ok_or_else(|| {
                Error::msg(format!("no buffer carries requested output \"{name}\""))
            })?,
        };
        output_bufs.push((name.clone(), buf));
    }

    let program = Program {
        ops,
        meta,
        inputs: input_bufs,
        outputs: output_bufs,
        temps,
    };
    Ok(CompiledModel { backend, program })
}
