//! Stoat - a graph compiler and execution scheduler for feed-forward
//! neural-network inference.
//!
//! A model arrives as an ONNX file (or a hand-built node list), gets pruned
//! to the subgraph the requested outputs need, staged into dependency
//! order, shape-inferred, and planned into a flat list of backend ops with
//! layout conversions inserted only where a kernel's preferred data
//! arrangement disagrees with what its producer wrote. Running the result
//! is one blocking submit over pre-allocated buffers; nothing is scheduled
//! or allocated at run time.
//!
//! # Usage
//!
//! ```no_run
//! use stoat::prelude::*;
//!
//! fn main() -> stoat::Result<()> {
//!     let model = ModelFile::from_path("lenet.onnx")?;
//!     let ctx = Context::new(CpuBackend::new());
//!     let compiled = compile(
//!         &ctx,
//!         &model,
//!         &[("data".to_string(), DType::F32, Shape::from(vec![1, 1, 28, 28]))],
//!         &["prob".to_string()],
//!     )?;
//!
//!     compiled.bind_input("data")?.copy_from_slice(&vec![0.0f32; 28 * 28])?;
//!     let outputs = compiled.run()?;
//!     println!("{:?}", outputs["prob"].to_vec::<f32>()?);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `stoat-core` | Shared vocabulary: dtypes, shapes, layouts, buffers, nodes, and the `Backend` trait |
//! | `stoat-cpu` | Multithreaded host kernels behind the `Backend` trait |
//! | `stoat` | Scheduling, shape inference, layout negotiation, program assembly, model loading |
//!
//! # Modules
//!
//! - [`graph`]: pruning, staging, and the identity-bypass passes
//! - [`infer`]: per-node output shape inference
//! - [`exec`]: planning, program assembly, and execution
//! - [`onnx`]: the interchange-format loader

pub mod exec;
pub mod graph;
pub mod infer;
pub mod onnx;

mod context;

/// Execution context carrying the compile-target backend.
pub use context::{Context, ContextScope};
/// Compilation entry point and the compiled artifacts.
pub use exec::{compile, CompiledModel, OpMeta, Program};
/// Model loading.
pub use onnx::ModelFile;
/// Core vocabulary, re-exported so downstream code can depend on this
/// crate alone.
pub use stoat_core::{
    AttrValue, Backend, BackendDevice, DType, Error, Layout, Node, OpKind, Result, Shape,
    TensorBuffer,
};

/// The common imports for building and running models.
pub mod prelude {
    pub use crate::context::{Context, ContextScope};
    pub use crate::exec::{compile, CompiledModel};
    pub use crate::graph::{bypass_dropout, bypass_reshape_before_fc, prune_and_stage};
    pub use crate::onnx::ModelFile;
    pub use stoat_core::{
        AttrValue, Backend, BackendDevice, DType, EltwiseFunc, Error, Layout, Node, OpKind,
        PoolMode, Result, Shape, TensorBuffer,
    };
    pub use stoat_cpu::CpuBackend;
}
