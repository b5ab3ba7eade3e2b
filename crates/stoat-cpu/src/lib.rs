// CPU Backend - multithreaded host kernels for the stoat execution scheduler
//
// This crate provides the host implementation of the stoat Backend trait.
// Every operator the graph compiler can emit has a kernel module here; the
// backend's job is to validate buffer shapes/layouts/dtypes when an op is
// built, so that by the time a program runs, execution is a straight walk
// over pre-checked ops.
//
// ARCHITECTURE:
// - CpuDevice is a plain handle; there is no per-device state to manage
// - CpuOp is an enum over one struct per kernel family (conv, pool, ...)
// - Builders do all shape/layout/dtype checking and any one-time data
//   preparation (convolution packs its weights into a channels-last order)
// - Matrix multiplication goes through the gemm crate; the other kernels
//   are rayon loops over row or plane chunks
// - The convolution kernel wants channels-last (nhwc) activations, the
//   window/statistics kernels want channels-first (nchw); the scheduler
//   reads these preferences and inserts reorders where they disagree
//
// USAGE:
//   let backend = CpuBackend::new();
//   let op = backend.eltwise(EltwiseFunc::Relu, &src, &dst)?;
//   backend.submit(&[op])?;

mod conv;
mod eltwise;
mod fc;
mod norm;
mod pool;
mod reorder;
mod softmax;

pub use conv::Conv2dOp;
pub use eltwise::EltwiseOp;
pub use fc::InnerProductOp;
pub use norm::BatchNormOp;
pub use pool::Pool2dOp;
pub use reorder::ReorderOp;
pub use softmax::SoftmaxOp;

use stoat_core::{
    Backend, BackendDevice, DType, EltwiseFunc, Error, Layout, OpFault, OpKind, PoolMode, Result,
    Spatial2d, TensorBuffer,
};

// CpuDevice - the host as an execution device

/// The host CPU as a backend device. Carries no state; kernels share the
/// process-global rayon pool.
#[derive(Debug, Clone, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuBackend - the Backend trait implementation

/// The CPU backend. Building it is free; clone it as needed.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend {
    device: CpuDevice,
}

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend { device: CpuDevice }
    }
}

/// One built CPU primitive: a kernel invocation or a layout conversion.
pub enum CpuOp {
    Conv2d(Conv2dOp),
    Pool2d(Pool2dOp),
    InnerProduct(InnerProductOp),
    BatchNorm(BatchNormOp),
    Eltwise(EltwiseOp),
    Softmax(SoftmaxOp),
    Reorder(ReorderOp),
}

impl CpuOp {
    fn execute(&self) -> Result<()> {
        match self {
            CpuOp::Conv2d(op) => op.execute(),
            CpuOp::Pool2d(op) => op.execute(),
            CpuOp::InnerProduct(op) => op.execute(),
            CpuOp::BatchNorm(op) => op.execute(),
            CpuOp::Eltwise(op) => op.execute(),
            CpuOp::Softmax(op) => op.execute(),
            CpuOp::Reorder(op) => op.execute(),
        }
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Op = CpuOp;

    fn device(&self) -> &CpuDevice {
        &self.device
    }

    // ---- Layout preferences ----

    fn preferred_input_layout(&self, kind: OpKind, current: Layout) -> Layout {
        match kind {
            // The conv kernel reads one input pixel across all channels at a
            // time, so it always wants channels-last.
            OpKind::Conv => Layout::Nhwc,
            // Window and statistics kernels walk whole channel planes.
            OpKind::MaxPool | OpKind::AveragePool | OpKind::BatchNorm => Layout::Nchw,
            // Row-oriented kernels and reshape need elements in logical order.
            OpKind::Fc | OpKind::Softmax | OpKind::Reshape => {
                if current == Layout::Nhwc {
                    Layout::Nchw
                } else {
                    current
                }
            }
            // Element-wise kernels are layout-blind.
            OpKind::Relu | OpKind::LeakyRelu | OpKind::Elu | OpKind::Tanh | OpKind::Dropout => {
                current
            }
        }
    }

    fn preferred_output_layout(&self, kind: OpKind, input: Layout) -> Layout {
        match kind {
            OpKind::Conv => Layout::Nhwc,
            OpKind::MaxPool | OpKind::AveragePool | OpKind::BatchNorm => Layout::Nchw,
            OpKind::Fc => Layout::Nc,
            OpKind::Softmax
            | OpKind::Reshape
            | OpKind::Relu
            | OpKind::LeakyRelu
            | OpKind::Elu
            | OpKind::Tanh
            | OpKind::Dropout => input,
        }
    }

    // ---- Op builders ----

    fn conv2d(
        &self,
        args: &Spatial2d,
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: Option<&TensorBuffer>,
        dst: &TensorBuffer,
    ) -> Result<CpuOp> {
        Ok(CpuOp::Conv2d(Conv2dOp::build(args, src, weights, bias, dst)?))
    }

    fn pool2d(
        &self,
        mode: PoolMode,
        args: &Spatial2d,
        src: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<CpuOp> {
        Ok(CpuOp::Pool2d(Pool2dOp::build(mode, args, src, dst)?))
    }

    fn inner_product(
        &self,
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<CpuOp> {
        Ok(CpuOp::InnerProduct(InnerProductOp::build(
            src, weights, bias, dst,
        )?))
    }

    fn batch_norm(
        &self,
        epsilon: f32,
        src: &TensorBuffer,
        scale: &TensorBuffer,
        shift: &TensorBuffer,
        mean: &TensorBuffer,
        variance: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<CpuOp> {
        Ok(CpuOp::BatchNorm(BatchNormOp::build(
            epsilon, src, scale, shift, mean, variance, dst,
        )?))
    }

    fn eltwise(
        &self,
        func: EltwiseFunc,
        src: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<CpuOp> {
        Ok(CpuOp::Eltwise(EltwiseOp::build(func, src, dst)?))
    }

    fn softmax(&self, src: &TensorBuffer, dst: &TensorBuffer) -> Result<CpuOp> {
        Ok(CpuOp::Softmax(SoftmaxOp::build(src, dst)?))
    }

    fn reorder(&self, src: &TensorBuffer, dst: &TensorBuffer) -> Result<CpuOp> {
        Ok(CpuOp::Reorder(ReorderOp::build(src, dst)?))
    }

    fn submit(&self, ops: &[CpuOp]) -> std::result::Result<(), OpFault> {
        for (index, op) in ops.iter().enumerate() {
            op.execute().map_err(|e| OpFault {
                index,
                msg: e.to_string(),
            })?;
        }
        Ok(())
    }
}

// Shared builder checks

/// All buffers must carry the same dtype; returns it.
pub(crate) fn same_dtype(bufs: &[&TensorBuffer]) -> Result<DType> {
    let first = bufs[0].dtype();
    for b in &bufs[1..] {
        if b.dtype() != first {
            return Err(Error::DTypeMismatch {
                expected: first,
                got: b.dtype(),
            });
        }
    }
    Ok(first)
}
