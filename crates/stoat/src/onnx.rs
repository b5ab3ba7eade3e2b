// Model loading from the ONNX interchange format
//
// The loader is a hand-rolled protobuf reader covering exactly the messages
// a feed-forward inference graph needs: ModelProto (for its graph), then
// GraphProto's nodes, initializers, and declared inputs/outputs. Everything
// else in the format (docstrings, opset imports, value-info type shapes,
// external data) is skipped field by field, so models produced by full
// exporters still load.
//
// Decoding is strict where it matters and lenient where it does not:
//   - An unknown operator type is an error (the graph cannot run without it)
//   - A truncated or corrupt stream is an error, never a panic
//   - Attribute kinds the operators never read (strings, tensors, graphs)
//     are dropped silently
//   - Initializers with non-float element types are skipped; half-precision
//     data is widened to f32 at load time since kernels compute in f32/f64

use std::collections::HashMap;
use std::path::Path;

use half::{bf16, f16};
use stoat_core::{bail, AttrValue, Error, Node, OpKind, Result, Shape, TensorBuffer};

// TensorProto.data_type values for the element types the loader accepts.
const ONNX_FLOAT: i64 = 1;
const ONNX_FLOAT16: i64 = 10;
const ONNX_DOUBLE: i64 = 11;
const ONNX_BFLOAT16: i64 = 16;

/// A decoded model: the graph's operator list plus its constant tensors.
///
/// `nodes` preserves file order; scheduling does not depend on it.
#[derive(Debug, Clone, Default)]
pub struct ModelFile {
    pub graph_name: String,
    /// Initializer tensors by name, ready to bind as op inputs.
    pub parameters: HashMap<String, TensorBuffer>,
    pub nodes: Vec<Node>,
    /// Graph-declared inputs that are not covered by an initializer; these
    /// are the values a caller binds at run time.
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
}

impl ModelFile {
    pub fn from_path(path: impl AsRef<Path>) -> Result<ModelFile> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| Error::msg(format!("cannot read {}: {e}", path.as_ref().display())))?;
        ModelFile::from_bytes(&bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<ModelFile> {
        let mut dec = PbDecoder::new(data);
        let mut graph: Option<&[u8]> = None;
        while dec.remaining() > 0 {
            let (field, wire) = dec.read_tag()?;
            match (field, wire) {
                // ModelProto.graph
                (7, 2) => graph = Some(dec.read_bytes()?),
                (_, wire) => dec.skip_field(wire)?,
            }
        }
        match graph {
            Some(bytes) => decode_graph(bytes),
            None => Err(Error::msg("model holds no graph")),
        }
    }
}

fn decode_graph(data: &[u8]) -> Result<ModelFile> {
    let mut dec = PbDecoder::new(data);
    let mut model = ModelFile::default();
    while dec.remaining() > 0 {
        let (field, wire) = dec.read_tag()?;
        match (field, wire) {
            (1, 2) => model.nodes.push(decode_node(dec.read_bytes()?)?),
            (2, 2) => model.graph_name = dec.read_string()?,
            (5, 2) => {
                if let Some((name, buffer)) = decode_tensor(dec.read_bytes()?)?.into_buffer()? {
                    model.parameters.insert(name, buffer);
                }
            }
            (11, 2) => model.input_names.push(value_info_name(dec.read_bytes()?)?),
            (12, 2) => model.output_names.push(value_info_name(dec.read_bytes()?)?),
            (_, wire) => dec.skip_field(wire)?,
        }
    }
    // The format declares every initializer as a graph input too; only the
    // uncovered names are runtime inputs.
    model
        .input_names
        .retain(|name| !model.parameters.contains_key(name));
    Ok(model)
}

// ---- protobuf wire reader ----

/// Cursor over a protobuf-encoded byte stream.
///
/// Every read checks bounds before advancing, so `pos <= data.len()` holds
/// throughout and malformed input surfaces as an error.
struct PbDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PbDecoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        PbDecoder { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            if self.pos >= self.data.len() {
                bail!("protobuf: unexpected end of data in varint");
            }
            let byte = self.data[self.pos];
            self.pos += 1;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                bail!("protobuf: varint too long");
            }
        }
    }

    fn read_tag(&mut self) -> Result<(u64, u64)> {
        let tag = self.read_varint()?;
        Ok((tag >> 3, tag & 0x7))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        if len > self.remaining() {
            bail!("protobuf: length-delimited field exceeds data");
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::msg("protobuf: string field is not valid utf-8"))
    }

    fn read_f32(&mut self) -> Result<f32> {
        if self.remaining() < 4 {
            bail!("protobuf: unexpected end of data in fixed32");
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64> {
        if self.remaining() < 8 {
            bail!("protobuf: unexpected end of data in fixed64");
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(f64::from_le_bytes(bytes))
    }

    fn skip_field(&mut self, wire: u64) -> Result<()> {
        match wire {
            0 => {
                self.read_varint()?;
            }
            1 => {
                self.read_f64()?;
            }
            2 => {
                self.read_bytes()?;
            }
            5 => {
                self.read_f32()?;
            }
            other => bail!("protobuf: unsupported wire type {other}"),
        }
        Ok(())
    }
}

// ---- message decoders ----

fn value_info_name(data: &[u8]) -> Result<String> {
    let mut dec = PbDecoder::new(data);
    let mut name = String::new();
    while dec.remaining() > 0 {
        let (field, wire) = dec.read_tag()?;
        match (field, wire) {
            (1, 2) => name = dec.read_string()?,
            (_, wire) => dec.skip_field(wire)?,
        }
    }
    Ok(name)
}

fn decode_node(data: &[u8]) -> Result<Node> {
    let mut dec = PbDecoder::new(data);
    let mut inputs: Vec<String> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();
    let mut op_type = String::new();
    let mut attrs: Vec<(String, AttrValue)> = Vec::new();
    while dec.remaining() > 0 {
        let (field, wire) = dec.read_tag()?;
        match (field, wire) {
            (1, 2) => inputs.push(dec.read_string()?),
            (2, 2) => outputs.push(dec.read_string()?),
            (4, 2) => op_type = dec.read_string()?,
            (5, 2) => {
                let (name, value) = decode_attribute(dec.read_bytes()?)?;
                if let Some(value) = value {
                    attrs.push((name, value));
                }
            }
            (_, wire) => dec.skip_field(wire)?,
        }
    }
    let kind = OpKind::from_onnx_type(&op_type)?;
    let mut node = Node::new(kind, inputs, outputs);
    for (name, value) in attrs {
        node = node.with_attr(name, value);
    }
    Ok(node)
}

/// Decode one AttributeProto. Returns the attribute's name and its value,
/// or `None` for value kinds the operators never read.
fn decode_attribute(data: &[u8]) -> Result<(String, Option<AttrValue>)> {
    let mut dec = PbDecoder::new(data);
    let mut name = String::new();
    let mut attr_type: Option<i64> = None;
    let mut int_value: Option<i64> = None;
    let mut float_value: Option<f32> = None;
    let mut ints: Vec<i64> = Vec::new();
    let mut floats: Vec<f32> = Vec::new();
    while dec.remaining() > 0 {
        let (field, wire) = dec.read_tag()?;
        match (field, wire) {
            (1, 2) => name = dec.read_string()?,
            (2, 5) => float_value = Some(dec.read_f32()?),
            (3, 0) => int_value = Some(dec.read_varint()? as i64),
            // s, t, g and their repeated forms carry nothing the supported
            // operators read.
            (4, 2) | (5, 2) | (6, 2) | (9, 2) | (10, 2) | (11, 2) => {
                dec.read_bytes()?;
            }
            (7, 5) => floats.push(dec.read_f32()?),
            (7, 2) => {
                let mut inner = PbDecoder::new(dec.read_bytes()?);
                while inner.remaining() > 0 {
                    floats.push(inner.read_f32()?);
                }
            }
            (8, 0) => ints.push(dec.read_varint()? as i64),
            (8, 2) => {
                let mut inner = PbDecoder::new(dec.read_bytes()?);
                while inner.remaining() > 0 {
                    ints.push(inner.read_varint()? as i64);
                }
            }
            (20, 0) => attr_type = Some(dec.read_varint()? as i64),
            (_, wire) => dec.skip_field(wire)?,
        }
    }
    // AttributeType: FLOAT=1, INT=2, STRING=3, FLOATS=6, INTS=7. Exporters
    // that omit the type tag get whichever payload is present.
    let value = match attr_type {
        Some(1) => float_value.map(AttrValue::Float),
        Some(2) => int_value.map(AttrValue::Int),
        Some(6) => Some(AttrValue::Floats(floats)),
        Some(7) => Some(AttrValue::Ints(ints)),
        Some(_) => None,
        None => {
            if let Some(v) = int_value {
                Some(AttrValue::Int(v))
            } else if let Some(v) = float_value {
                Some(AttrValue::Float(v))
            } else if !ints.is_empty() {
                Some(AttrValue::Ints(ints))
            } else if !floats.is_empty() {
                Some(AttrValue::Floats(floats))
            } else {
                None
            }
        }
    };
    Ok((name, value))
}

#[derive(Default)]
struct TensorPb {
    name: String,
    dims: Vec<i64>,
    data_type: i64,
    raw_data: Vec<u8>,
    float_data: Vec<f32>,
    int32_data: Vec<i64>,
    double_data: Vec<f64>,
}

fn decode_tensor(data: &[u8]) -> Result<TensorPb> {
    let mut dec = PbDecoder::new(data);
    let mut t = TensorPb::default();
    while dec.remaining() > 0 {
        let (field, wire) = dec.read_tag()?;
        match (field, wire) {
            (1, 0) => t.dims.push(dec.read_varint()? as i64),
            (1, 2) => {
                let mut inner = PbDecoder::new(dec.read_bytes()?);
                while inner.remaining() > 0 {
                    t.dims.push(inner.read_varint()? as i64);
                }
            }
            (2, 0) => t.data_type = dec.read_varint()? as i64,
            (4, 2) => t.float_data.extend(raw_le_f32(dec.read_bytes()?)?),
            (4, 5) => t.float_data.push(dec.read_f32()?),
            // int32_data carries half-precision bit patterns.
            (5, 0) => t.int32_data.push(dec.read_varint()? as i64),
            (5, 2) => {
                let mut inner = PbDecoder::new(dec.read_bytes()?);
                while inner.remaining() > 0 {
                    t.int32_data.push(inner.read_varint()? as i64);
                }
            }
            (8, 2) => t.name = dec.read_string()?,
            (9, 2) => t.raw_data = dec.read_bytes()?.to_vec(),
            (10, 2) => t.double_data.extend(raw_le_f64(dec.read_bytes()?)?),
            (10, 1) => t.double_data.push(dec.read_f64()?),
            (_, wire) => dec.skip_field(wire)?,
        }
    }
    Ok(t)
}

impl TensorPb {
    /// Turn the decoded tensor into a named buffer. Element types outside
    /// the float family yield `None` and the caller drops the tensor.
    fn into_buffer(self) -> Result<Option<(String, TensorBuffer)>> {
        let mut dims: Vec<usize> = Vec::with_capacity(self.dims.len());
        for &d in &self.dims {
            match usize::try_from(d) {
                Ok(d) => dims.push(d),
                Err(_) => bail!("tensor \"{}\" has negative dim {d}", self.name),
            }
        }
        let shape = Shape::from(dims);
        let buffer = match self.data_type {
            ONNX_FLOAT => {
                let data = if self.raw_data.is_empty() {
                    self.float_data
                } else {
                    raw_le_f32(&self.raw_data)?
                };
                TensorBuffer::from_vec(data, shape)?
            }
            ONNX_DOUBLE => {
                let data = if self.raw_data.is_empty() {
                    self.double_data
                } else {
                    raw_le_f64(&self.raw_data)?
                };
                TensorBuffer::from_vec(data, shape)?
            }
            ONNX_FLOAT16 => {
                let data: Vec<f32> = if self.raw_data.is_empty() {
                    self.int32_data
                        .iter()
                        .map(|&v| f16::from_bits(v as u16).to_f32())
                        .collect()
                } else {
                    raw_le_u16(&self.raw_data)?
                        .into_iter()
                        .map(|bits| f16::from_bits(bits).to_f32())
                        .collect()
                };
                TensorBuffer::from_vec(data, shape)?
            }
            ONNX_BFLOAT16 => {
                let data: Vec<f32> = if self.raw_data.is_empty() {
                    self.int32_data
                        .iter()
                        .map(|&v| bf16::from_bits(v as u16).to_f32())
                        .collect()
                } else {
                    raw_le_u16(&self.raw_data)?
                        .into_iter()
                        .map(|bits| bf16::from_bits(bits).to_f32())
                        .collect()
                };
                TensorBuffer::from_vec(data, shape)?
            }
            _ => return Ok(None),
        };
        Ok(Some((self.name, buffer)))
    }
}

fn raw_le_f32(raw: &[u8]) -> Result<Vec<f32>> {
    if raw.len() % 4 != 0 {
        bail!("raw tensor data length {} is not a multiple of 4", raw.len());
    }
    Ok(raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn raw_le_f64(raw: &[u8]) -> Result<Vec<f64>> {
    if raw.len() % 8 != 0 {
        bail!("raw tensor data length {} is not a multiple of 8", raw.len());
    }
    Ok(raw
        .chunks_exact(8)
        .map(|c| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(c);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

fn raw_le_u16(raw: &[u8]) -> Result<Vec<u16>> {
    if raw.len() % 2 != 0 {
        bail!("raw tensor data length {} is not a multiple of 2", raw.len());
    }
    Ok(raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}
