use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

// Node - one operation of the model graph
//
// A Node is the typed form of one operator record from the interchange
// format: a closed operator kind, ordered input and output names, and a
// small map of typed attributes. Nodes are immutable once built; the
// scheduler refers to them by index (NodeId lives with the graph), so two
// nodes that happen to share name lists stay distinct.

/// Closed enumeration of supported operator kinds.
///
/// Dispatch everywhere is an exhaustive `match` on this enum, so adding a
/// kind makes the compiler point at every site that needs extending. Unknown
/// interchange strings are rejected at decode time with `Unimplemented`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Conv,
    MaxPool,
    AveragePool,
    Fc,
    Reshape,
    BatchNorm,
    Relu,
    LeakyRelu,
    Elu,
    Tanh,
    Dropout,
    Softmax,
}

impl OpKind {
    /// Map an interchange op-type string to a kind.
    pub fn from_onnx_type(s: &str) -> Result<OpKind> {
        Ok(match s {
            "Conv" => OpKind::Conv,
            "MaxPool" => OpKind::MaxPool,
            "AveragePool" => OpKind::AveragePool,
            "FC" => OpKind::Fc,
            "Reshape" => OpKind::Reshape,
            "BatchNormalization" => OpKind::BatchNorm,
            "Relu" => OpKind::Relu,
            "LeakyRelu" => OpKind::LeakyRelu,
            "Elu" => OpKind::Elu,
            "Tanh" => OpKind::Tanh,
            "Dropout" => OpKind::Dropout,
            "Softmax" => OpKind::Softmax,
            other => {
                return Err(Error::Unimplemented {
                    op: other.to_string(),
                })
            }
        })
    }

    /// The interchange op-type string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Conv => "Conv",
            OpKind::MaxPool => "MaxPool",
            OpKind::AveragePool => "AveragePool",
            OpKind::Fc => "FC",
            OpKind::Reshape => "Reshape",
            OpKind::BatchNorm => "BatchNormalization",
            OpKind::Relu => "Relu",
            OpKind::LeakyRelu => "LeakyRelu",
            OpKind::Elu => "Elu",
            OpKind::Tanh => "Tanh",
            OpKind::Dropout => "Dropout",
            OpKind::Softmax => "Softmax",
        }
    }

    /// Whether the output shape equals the first input's shape.
    pub fn preserves_shape(self) -> bool {
        matches!(
            self,
            OpKind::BatchNorm
                | OpKind::Relu
                | OpKind::LeakyRelu
                | OpKind::Elu
                | OpKind::Tanh
                | OpKind::Dropout
                | OpKind::Softmax
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
}

impl AttrValue {
    fn kind_name(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Ints(_) => "ints",
            AttrValue::Floats(_) => "floats",
        }
    }
}

/// One graph operation: kind, ordered input/output names, typed attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: OpKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attrs: BTreeMap<String, AttrValue>,
}

impl Node {
    pub fn new(
        kind: OpKind,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Node {
            kind,
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute attachment.
    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// The i-th input name; errors identify the node by its primary output.
    pub fn input(&self, i: usize) -> Result<&str> {
        self.inputs
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| Error::msg(format!("node \"{}\" has no input {i}", self.ident())))
    }

    /// The primary output name.
    pub fn output(&self) -> &str {
        self.outputs.first().map(String::as_str).unwrap_or("")
    }

    /// A printable identity for error context: the primary output name, or
    /// the op kind when the node is (malformed and) output-less.
    pub fn ident(&self) -> &str {
        match self.outputs.first() {
            Some(name) if !name.is_empty() => name,
            _ => self.kind.as_str(),
        }
    }

    /// Rewrite every occurrence of `from` in the input list to `to`.
    /// Used by the graph simplification passes to bypass identity-like nodes.
    pub fn replace_input(&mut self, from: &str, to: &str) {
        for name in &mut self.inputs {
            if name == from {
                *name = to.to_string();
            }
        }
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    fn unsupported(&self, attr: &str, reason: impl Into<String>) -> Error {
        Error::UnsupportedAttribute {
            node: self.ident().to_string(),
            attr: attr.to_string(),
            reason: reason.into(),
        }
    }

    /// Required int attribute.
    pub fn attr_int(&self, name: &str) -> Result<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.unsupported(name, format!("expected int, got {}", other.kind_name()))),
            None => Err(self.unsupported(name, "missing")),
        }
    }

    /// Int attribute with a default when absent; wrong kind is still an error.
    pub fn attr_int_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.attrs.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.unsupported(name, format!("expected int, got {}", other.kind_name()))),
            None => Ok(default),
        }
    }

    /// Required float attribute.
    pub fn attr_float(&self, name: &str) -> Result<f32> {
        match self.attrs.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(other) => Err(self.unsupported(name, format!("expected float, got {}", other.kind_name()))),
            None => Err(self.unsupported(name, "missing")),
        }
    }

    /// Float attribute with a default when absent.
    pub fn attr_float_or(&self, name: &str, default: f32) -> Result<f32> {
        match self.attrs.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(other) => Err(self.unsupported(name, format!("expected float, got {}", other.kind_name()))),
            None => Ok(default),
        }
    }

    /// Required int-list attribute.
    pub fn attr_ints(&self, name: &str) -> Result<&[i64]> {
        match self.attrs.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v),
            Some(other) => Err(self.unsupported(name, format!("expected ints, got {}", other.kind_name()))),
            None => Err(self.unsupported(name, "missing")),
        }
    }

    /// Int-list attribute, or `default` when absent.
    pub fn attr_ints_or<'a>(&'a self, name: &str, default: &'a [i64]) -> Result<&'a [i64]> {
        match self.attrs.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v),
            Some(other) => Err(self.unsupported(name, format!("expected ints, got {}", other.kind_name()))),
            None => Ok(default),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> ({})",
            self.kind,
            self.inputs.join(", "),
            self.outputs.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_kind_roundtrip() {
        for s in [
            "Conv",
            "MaxPool",
            "AveragePool",
            "FC",
            "Reshape",
            "BatchNormalization",
            "Relu",
            "LeakyRelu",
            "Elu",
            "Tanh",
            "Dropout",
            "Softmax",
        ] {
            assert_eq!(OpKind::from_onnx_type(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_unknown_op_kind() {
        let err = OpKind::from_onnx_type("LSTM").unwrap_err();
        assert!(matches!(err, Error::Unimplemented { op } if op == "LSTM"));
    }

    #[test]
    fn test_attr_access() {
        let node = Node::new(OpKind::Conv, ["x", "w"], ["y"])
            .with_attr("strides", AttrValue::Ints(vec![2, 2]))
            .with_attr("alpha", AttrValue::Float(0.5));
        assert_eq!(node.attr_ints("strides").unwrap(), &[2, 2]);
        assert_eq!(node.attr_float("alpha").unwrap(), 0.5);
        assert_eq!(node.attr_int_or("group", 1).unwrap(), 1);
        assert!(matches!(
            node.attr_int("strides"),
            Err(Error::UnsupportedAttribute { .. })
        ));
        assert!(matches!(
            node.attr_ints("pads"),
            Err(Error::UnsupportedAttribute { .. })
        ));
    }

    #[test]
    fn test_replace_input() {
        let mut node = Node::new(OpKind::Relu, ["drop_out"], ["y"]);
        node.replace_input("drop_out", "conv_out");
        assert_eq!(node.inputs(), &["conv_out".to_string()]);
    }
}
