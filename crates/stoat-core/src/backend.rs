use std::fmt;

use crate::buffer::TensorBuffer;
use crate::error::Result;
use crate::layout::Layout;
use crate::node::OpKind;

// Backend - the compute-backend seam
//
// Everything above this trait (scheduler, shape inference, layout
// negotiation, program assembly) is backend-agnostic. The backend
// contributes exactly three things:
//
//   1. Which layout each kernel prefers (queried, then compared by value
//      by the negotiator - the backend never decides whether to reorder)
//   2. Primitive builders: given validated buffers and typed arguments,
//      build one executable op
//   3. A one-shot, blocking submit for the finished op list
//
// WHY A TRAIT AND NOT A FACTORY TABLE?
//
// The interchange format's op strings are mapped to the closed OpKind enum
// at decode time, and the planner dispatches with an exhaustive match. A
// backend that cannot support some kind returns Unimplemented from its
// builder; there is no runtime table to miss an entry in.

/// Identifies a compute device (e.g., "cpu").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// Pooling algorithm selector, shared by the pooling builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Max,
    /// Average over the full window, padding included in the divisor.
    Avg,
}

/// Element-wise activation family, with per-function parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EltwiseFunc {
    Relu,
    LeakyRelu { alpha: f32 },
    Elu { alpha: f32 },
    Tanh,
}

/// Spatial arguments shared by convolution and pooling.
///
/// `pads` is `[top, left, bottom, right]`; the output size along H is
/// `(H - kernel_h + top + bottom) / stride_h + 1` (floor), and likewise
/// along W with left/right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spatial2d {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 4],
}

impl Spatial2d {
    /// Output height and width for an input of the given spatial size.
    pub fn out_hw(&self, h: usize, w: usize) -> (usize, usize) {
        let oh = (h + self.pads[0] + self.pads[2] - self.kernel[0]) / self.strides[0] + 1;
        let ow = (w + self.pads[1] + self.pads[3] - self.kernel[1]) / self.strides[1] + 1;
        (oh, ow)
    }
}

/// A run-time fault from one submitted op.
///
/// `index` points into the submitted op list; the runner maps it back to the
/// node that emitted the op so the error can name the failing operation.
#[derive(Debug, Clone)]
pub struct OpFault {
    pub index: usize,
    pub msg: String,
}

impl fmt::Display for OpFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op {} failed: {}", self.index, self.msg)
    }
}

/// The compute backend: kernel layout preferences, primitive builders,
/// and one-shot execution.
///
/// All buffer arguments arrive with their layout already negotiated: builders
/// may reject unexpected layouts or shapes but never insert conversions
/// themselves. Built ops hold cheap buffer handles, so an op list stays valid
/// as long as the owning program keeps the buffers alive.
pub trait Backend: Send + Sync + Sized + 'static {
    type Device: BackendDevice;
    /// One built primitive: a kernel invocation or a layout conversion.
    type Op: Send + Sync;

    fn device(&self) -> &Self::Device;

    /// The layout this backend wants the primary variable input of `kind`
    /// to be in, given the layout the value currently has.
    fn preferred_input_layout(&self, kind: OpKind, current: Layout) -> Layout;

    /// The layout the kernel for `kind` naturally produces, given the
    /// (already negotiated) layout of its primary input.
    fn preferred_output_layout(&self, kind: OpKind, input: Layout) -> Layout;

    /// 2-d convolution: `src` [N,C,H,W] logical, `weights` [O,C,kH,kW]
    /// natural, optional `bias` [O], `dst` [N,O,oH,oW] logical.
    fn conv2d(
        &self,
        args: &Spatial2d,
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: Option<&TensorBuffer>,
        dst: &TensorBuffer,
    ) -> Result<Self::Op>;

    /// 2-d max/average pooling over `src` [N,C,H,W].
    fn pool2d(
        &self,
        mode: PoolMode,
        args: &Spatial2d,
        src: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self::Op>;

    /// Fully connected: `src` [N, K] or [N,C,H,W] flattened to K per row,
    /// `weights` [O, K], `bias` [O], `dst` [N, O].
    fn inner_product(
        &self,
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self::Op>;

    /// Inference batch normalization with per-channel statistics.
    #[allow(clippy::too_many_arguments)]
    fn batch_norm(
        &self,
        epsilon: f32,
        src: &TensorBuffer,
        scale: &TensorBuffer,
        shift: &TensorBuffer,
        mean: &TensorBuffer,
        variance: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self::Op>;

    /// Element-wise activation, layout-blind.
    fn eltwise(&self, func: EltwiseFunc, src: &TensorBuffer, dst: &TensorBuffer)
        -> Result<Self::Op>;

    /// Softmax over axis 1 (trailing dims flattened per row).
    fn softmax(&self, src: &TensorBuffer, dst: &TensorBuffer) -> Result<Self::Op>;

    /// Copy `src` into `dst` preserving logical element order. Covers layout
    /// conversion (same shape, different layout), plain copies (same shape
    /// and layout), and reshape materialization (equal element counts).
    fn reorder(&self, src: &TensorBuffer, dst: &TensorBuffer) -> Result<Self::Op>;

    /// Execute the whole op list in order, blocking until done. Stops at the
    /// first faulting op. The backend may parallelize internally but must
    /// preserve the observable ordering of writes between ops.
    fn submit(&self, ops: &[Self::Op]) -> std::result::Result<(), OpFault>;
}
