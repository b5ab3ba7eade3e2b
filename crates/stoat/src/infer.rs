// Shape inference - derive every staged node's output shape before planning
//
// Planning allocates buffers up front, so each node's output shape must be
// known from its attributes and its inputs' shapes alone. Inference walks
// the staged graph once, threading a name -> Shape map; any inconsistency
// (window larger than the padded input, weight dims that do not match the
// activation, an impossible reshape) is reported here, before a single
// kernel is built.

use std::collections::HashMap;

use stoat_core::{bail, Error, Node, OpKind, Result, Shape, Spatial2d};

pub(crate) fn lookup<'a>(shapes: &'a HashMap<String, Shape>, name: &str) -> Result<&'a Shape> {
    shapes.get(name).ok_or_else(|| Error::MissingValue {
        name: name.to_string(),
    })
}

pub(crate) fn unsupported(node: &Node, attr: &str, reason: impl Into<String>) -> Error {
    Error::UnsupportedAttribute {
        node: node.ident().to_string(),
        attr: attr.to_string(),
        reason: reason.into(),
    }
}

/// Two positive entries out of an int-list attribute.
fn pair(node: &Node, attr: &str, raw: &[i64]) -> Result<[usize; 2]> {
    let &[a, b] = raw else {
        return Err(unsupported(
            node,
            attr,
            format!("expected 2 entries, got {}", raw.len()),
        ));
    };
    if a < 1 || b < 1 {
        return Err(unsupported(
            node,
            attr,
            format!("entries must be positive, got [{a}, {b}]"),
        ));
    }
    Ok([a as usize, b as usize])
}

/// Padding as `[top, left, bottom, right]`. Absent means zero; a 2-entry
/// list `[p0, p1]` applies symmetrically as `[p0, p1, p0, p1]`.
fn pads4(node: &Node) -> Result<[usize; 4]> {
    let raw = node.attr_ints_or("pads", &[0, 0, 0, 0])?;
    let entry = |v: i64| -> Result<usize> {
        usize::try_from(v).map_err(|_| unsupported(node, "pads", format!("negative entry {v}")))
    };
    match raw {
        &[p0, p1] => {
            let (a, b) = (entry(p0)?, entry(p1)?);
            Ok([a, b, a, b])
        }
        &[t, l, b, r] => Ok([entry(t)?, entry(l)?, entry(b)?, entry(r)?]),
        _ => Err(unsupported(
            node,
            "pads",
            format!("expected 2 or 4 entries, got {}", raw.len()),
        )),
    }
}

fn spatial(node: &Node, kernel: [usize; 2]) -> Result<Spatial2d> {
    let strides = pair(node, "strides", node.attr_ints_or("strides", &[1, 1])?)?;
    let pads = pads4(node)?;
    Ok(Spatial2d {
        kernel,
        strides,
        pads,
    })
}

/// Spatial arguments for a convolution. The kernel size comes from the
/// `kernel_shape` attribute when present, otherwise from the weight tensor's
/// trailing dims.
pub(crate) fn conv_spatial(node: &Node, weights: &Shape) -> Result<Spatial2d> {
    let kernel = if node.attrs().contains_key("kernel_shape") {
        pair(node, "kernel_shape", node.attr_ints("kernel_shape")?)?
    } else {
        [weights.dim(2)?, weights.dim(3)?]
    };
    spatial(node, kernel)
}

/// Spatial arguments for a pooling node; `kernel_shape` is required since
/// there is no weight tensor to fall back on.
pub(crate) fn pool_spatial(node: &Node) -> Result<Spatial2d> {
    let kernel = pair(node, "kernel_shape", node.attr_ints("kernel_shape")?)?;
    spatial(node, kernel)
}

/// `Spatial2d::out_hw` with the fit check the raw formula omits: the window
/// must lie inside the padded input or the subtraction underflows.
fn checked_out_hw(node: &Node, args: &Spatial2d, h: usize, w: usize) -> Result<(usize, usize)> {
    if h + args.pads[0] + args.pads[2] < args.kernel[0]
        || w + args.pads[1] + args.pads[3] < args.kernel[1]
    {
        bail!(
            "node \"{}\": {}x{} window does not fit {h}x{w} input with pads {:?}",
            node.ident(),
            args.kernel[0],
            args.kernel[1],
            args.pads
        );
    }
    Ok(args.out_hw(h, w))
}

fn infer_conv(node: &Node, shapes: &HashMap<String, Shape>) -> Result<Shape> {
    let src = lookup(shapes, node.input(0)?)?;
    let weights = lookup(shapes, node.input(1)?)?;
    if src.rank() != 4 {
        bail!(
            "node \"{}\": conv input must be 4-d, got {src}",
            node.ident()
        );
    }
    if weights.rank() != 4 {
        bail!(
            "node \"{}\": conv weights must be 4-d, got {weights}",
            node.ident()
        );
    }
    let args = conv_spatial(node, weights)?;
    let (n, c, h, w) = (src.dim(0)?, src.dim(1)?, src.dim(2)?, src.dim(3)?);
    let oc = weights.dim(0)?;
    if weights.dim(1)? != c || weights.dim(2)? != args.kernel[0] || weights.dim(3)? != args.kernel[1]
    {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(vec![oc, c, args.kernel[0], args.kernel[1]]),
            got: weights.clone(),
        });
    }
    match node.inputs().get(2) {
        Some(name) if !name.is_empty() => {
            let bias = lookup(shapes, name)?;
            if bias.elem_count() != oc {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(oc),
                    got: bias.clone(),
                });
            }
        }
        _ => {}
    }
    let (oh, ow) = checked_out_hw(node, &args, h, w)?;
    Ok(Shape::from(vec![n, oc, oh, ow]))
}

fn infer_pool(node: &Node, shapes: &HashMap<String, Shape>) -> Result<Shape> {
    let src = lookup(shapes, node.input(0)?)?;
    if src.rank() != 4 {
        bail!(
            "node \"{}\": pool input must be 4-d, got {src}",
            node.ident()
        );
    }
    let args = pool_spatial(node)?;
    let (oh, ow) = checked_out_hw(node, &args, src.dim(2)?, src.dim(3)?)?;
    Ok(Shape::from(vec![src.dim(0)?, src.dim(1)?, oh, ow]))
}

fn infer_fc(node: &Node, shapes: &HashMap<String, Shape>) -> Result<Shape> {
    let axis = node.attr_int_or("axis", 1)?;
    if axis != 1 {
        return Err(unsupported(
            node,
            "axis",
            format!("only axis 1 is supported, got {axis}"),
        ));
    }
    let axis_w = node.attr_int_or("axis_w", 1)?;
    if axis_w != 1 {
        return Err(unsupported(
            node,
            "axis_w",
            format!("only axis_w 1 is supported, got {axis_w}"),
        ));
    }
    let src = lookup(shapes, node.input(0)?)?;
    let weights = lookup(shapes, node.input(1)?)?;
    let bias = lookup(shapes, node.input(2)?)?;
    if src.rank() != 2 && src.rank() != 4 {
        bail!("node \"{}\": fc input must be 2-d or 4-d, got {src}", node.ident());
    }
    let in_features: usize = src.dims()[1..].iter().product();
    let out_features = bias.elem_count();
    if weights.rank() != 2 || weights.dim(0)? != out_features || weights.dim(1)? != in_features {
        return Err(Error::ShapeMismatch {
            expected: Shape::from(vec![out_features, in_features]),
            got: weights.clone(),
        });
    }
    Ok(Shape::from(vec![src.dim(0)?, out_features]))
}

/// Resolve a reshape target against the input's element count. At most one
/// `-1` entry is inferred from the remaining known dims.
pub(crate) fn resolve_reshape(node: &Node, input: &Shape) -> Result<Shape> {
    let target = node.attr_ints("shape")?;
    let total = input.elem_count();
    let mut known: usize = 1;
    let mut fill: Option<usize> = None;
    let mut dims: Vec<usize> = Vec::with_capacity(target.len());
    for (i, &d) in target.iter().enumerate() {
        if d == -1 {
            if fill.is_some() {
                return Err(Error::InvalidReshape {
                    reason: "more than one -1 entry".to_string(),
                });
            }
            fill = Some(i);
            dims.push(0);
        } else if d < 1 {
            return Err(Error::InvalidReshape {
                reason: format!("dimension {d} is not positive"),
            });
        } else {
            known *= d as usize;
            dims.push(d as usize);
        }
    }
    match fill {
        Some(i) => {
            if total % known != 0 {
                return Err(Error::InvalidReshape {
                    reason: format!("{total} elements do not divide evenly over {known}"),
                });
            }
            dims[i] = total / known;
        }
        None if known != total => {
            return Err(Error::InvalidReshape {
                reason: format!("target holds {known} elements, input holds {total}"),
            });
        }
        None => {}
    }
    Ok(Shape::from(dims))
}

/// Output shape of one node given the shapes of everything before it.
pub fn infer_output_shape(node: &Node, shapes: &HashMap<String, Shape>) -> Result<Shape> {
    match node.kind() {
        OpKind::Conv => infer_conv(node, shapes),
        OpKind::MaxPool | OpKind::AveragePool => infer_pool(node, shapes),
        OpKind::Fc => infer_fc(node, shapes),
        OpKind::Reshape => resolve_reshape(node, lookup(shapes, node.input(0)?)?),
        OpKind::BatchNorm
        | OpKind::Relu
        | OpKind::LeakyRelu
        | OpKind::Elu
        | OpKind::Tanh
        | OpKind::Dropout
        | OpKind::Softmax => Ok(lookup(shapes, node.input(0)?)?.clone()),
    }
}
