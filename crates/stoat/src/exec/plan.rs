// Per-node planning: layout negotiation plus kernel op construction
//
// The negotiation protocol is value-based. The backend is asked which
// layout the kernel wants its primary input in and which layout the kernel
// writes; the planner compares those answers against what it has and
// inserts reorder ops only where they differ. Auxiliary inputs (weights,
// bias, statistics) always stay in their natural order; kernels that want
// them arranged differently repack internally when the op is built.
//
// A node whose output the caller requested additionally guarantees a
// natural-layout buffer: the kernel either writes it directly (when its
// native output layout is already natural) or writes its native scratch
// buffer and a trailing reorder materializes the visible copy. Downstream
// consumers always bind the kernel-native buffer so a consumer that likes
// that layout does not pay for a conversion back.

use std::collections::HashMap;
use std::fmt;

use stoat_core::{
    Backend, EltwiseFunc, Error, Layout, Node, OpKind, PoolMode, Result, Shape, TensorBuffer,
};

use crate::infer;

/// Everything planning one node produced.
pub(crate) struct NodePlan<B: Backend> {
    /// Ops in execution order: input reorders, the kernel, output reorder.
    pub ops: Vec<B::Op>,
    /// The buffer downstream consumers of the primary output read.
    pub binding: TensorBuffer,
    /// The natural-layout buffer handed to the caller when this node's
    /// output was requested.
    pub visible: Option<TensorBuffer>,
    /// Scratch buffers allocated for layout conversions.
    pub temps: usize,
}

// Manual Debug: B::Op carries no Debug bound.
impl<B: Backend> fmt::Debug for NodePlan<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePlan")
            .field("ops", &self.ops.len())
            .field("binding", &self.binding)
            .field("visible", &self.visible)
            .field("temps", &self.temps)
            .finish()
    }
}

fn bound<'a>(
    bindings: &'a HashMap<String, TensorBuffer>,
    node: &Node,
    i: usize,
) -> Result<&'a TensorBuffer> {
    let name = node.input(i)?;
    bindings.get(name).ok_or_else(|| Error::MissingValue {
        name: name.to_string(),
    })
}

/// Attach node identity to a builder failure.
fn wrap<T>(node: &Node, op: &str, r: Result<T>) -> Result<T> {
    r.map_err(|e| Error::Backend {
        node: node.ident().to_string(),
        op: op.to_string(),
        msg: e.to_string(),
    })
}

pub(crate) fn plan_node<B: Backend>(
    backend: &B,
    node: &Node,
    bindings: &HashMap<String, TensorBuffer>,
    out_shape: &Shape,
    required: bool,
) -> Result<NodePlan<B>> {
    if node.kind() == OpKind::Reshape {
        return plan_reshape(backend, node, bindings, out_shape, required);
    }

    let src = bound(bindings, node, 0)?;
    let mut ops: Vec<B::Op> = Vec::new();
    let mut temps = 0;

    // Input side: stage the value into the kernel's preferred layout.
    let preferred = backend.preferred_input_layout(node.kind(), src.layout());
    let src = if preferred == src.layout() {
        src.clone()
    } else {
        let staged = TensorBuffer::zeros(src.dtype(), src.shape().clone(), preferred)?;
        ops.push(wrap(node, "reorder", backend.reorder(src, &staged))?);
        temps += 1;
        staged
    };

    // Output side: the kernel writes its native layout. A requested output
    // must end up natural; when the two disagree the kernel gets a scratch
    // destination and a reorder fills the visible buffer.
    let natural = Layout::natural_for(out_shape);
    let out_layout = backend.preferred_output_layout(node.kind(), src.layout());
    let (dst, visible) = if !required {
        let dst = TensorBuffer::zeros(src.dtype(), out_shape.clone(), out_layout)?;
        (dst, None)
    } else if out_layout == natural {
        let buf = TensorBuffer::zeros(src.dtype(), out_shape.clone(), natural)?;
        (buf.clone(), Some(buf))
    } else {
        temps += 1;
        let native = TensorBuffer::zeros(src.dtype(), out_shape.clone(), out_layout)?;
        let buf = TensorBuffer::zeros(src.dtype(), out_shape.clone(), natural)?;
        (native, Some(buf))
    };

    let op = match node.kind() {
        OpKind::Conv => {
            let weights = bound(bindings, node, 1)?;
            let args = infer::conv_spatial(node, weights.shape())?;
            let bias = match node.inputs().get(2) {
                Some(name) if !name.is_empty() => Some(bound(bindings, node, 2)?),
                _ => None,
            };
            wrap(node, "conv", backend.conv2d(&args, &src, weights, bias, &dst))?
        }
        OpKind::MaxPool => {
            let args = infer::pool_spatial(node)?;
            wrap(node, "pool", backend.pool2d(PoolMode::Max, &args, &src, &dst))?
        }
        OpKind::AveragePool => {
            let args = infer::pool_spatial(node)?;
            wrap(node, "pool", backend.pool2d(PoolMode::Avg, &args, &src, &dst))?
        }
        OpKind::Fc => {
            let weights = bound(bindings, node, 1)?;
            let bias = bound(bindings, node, 2)?;
            wrap(
                node,
                "inner_product",
                backend.inner_product(&src, weights, bias, &dst),
            )?
        }
        OpKind::BatchNorm => {
            let epsilon = node.attr_float_or("epsilon", 1e-5)?;
            let scale = bound(bindings, node, 1)?;
            let shift = bound(bindings, node, 2)?;
            let mean = bound(bindings, node, 3)?;
            let variance = bound(bindings, node, 4)?;
            wrap(
                node,
                "batch_norm",
                backend.batch_norm(epsilon, &src, scale, shift, mean, variance, &dst),
            )?
        }
        OpKind::Relu => wrap(node, "eltwise", backend.eltwise(EltwiseFunc::Relu, &src, &dst))?,
        OpKind::LeakyRelu => {
            let alpha = node.attr_float_or("alpha", 0.01)?;
            wrap(
                node,
                "eltwise",
                backend.eltwise(EltwiseFunc::LeakyRelu { alpha }, &src, &dst),
            )?
        }
        OpKind::Elu => {
            let alpha = node.attr_float_or("alpha", 1.0)?;
            wrap(
                node,
                "eltwise",
                backend.eltwise(EltwiseFunc::Elu { alpha }, &src, &dst),
            )?
        }
        OpKind::Tanh => wrap(node, "eltwise", backend.eltwise(EltwiseFunc::Tanh, &src, &dst))?,
        OpKind::Softmax => {
            let axis = node.attr_int_or("axis", 1)?;
            if axis != 1 {
                return Err(infer::unsupported(
                    node,
                    "axis",
                    format!("only axis 1 is supported, got {axis}"),
                ));
            }
            wrap(node, "softmax", backend.softmax(&src, &dst))?
        }
        // A dropout that survived the bypass pass was itself requested;
        // at inference it is an identity copy.
        OpKind::Dropout => wrap(node, "reorder", backend.reorder(&src, &dst))?,
        OpKind::Reshape => unreachable!("reshape has no kernel"),
    };
    ops.push(op);

    if let Some(visible) = &visible {
        if !visible.ptr_eq(&dst) {
            ops.push(wrap(node, "reorder", backend.reorder(&dst, visible))?);
        }
    }

    Ok(NodePlan {
        ops,
        binding: dst,
        visible,
        temps,
    })
}

/// Reshape never computes. When the input's elements are already in logical
/// order and nobody outside needs the result, the output is an alias over
/// the same storage and no op is emitted at all. Otherwise one reorder
/// materializes the elements in natural order under the new shape.
fn plan_reshape<B: Backend>(
    backend: &B,
    node: &Node,
    bindings: &HashMap<String, TensorBuffer>,
    out_shape: &Shape,
    required: bool,
) -> Result<NodePlan<B>> {
    let src = bound(bindings, node, 0)?;
    if !required && src.layout().is_natural() {
        let binding = src.alias_reshape(out_shape.clone())?;
        return Ok(NodePlan {
            ops: Vec::new(),
            binding,
            visible: None,
            temps: 0,
        });
    }
    let dst = TensorBuffer::zeros(src.dtype(), out_shape.clone(), Layout::natural_for(out_shape))?;
    let op = wrap(node, "reorder", backend.reorder(src, &dst))?;
    let visible = if required { Some(dst.clone()) } else { None };
    Ok(NodePlan {
        ops: vec![op],
        binding: dst,
        visible,
        temps: 0,
    })
}
