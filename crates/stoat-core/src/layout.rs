use std::fmt;

use crate::shape::Shape;

// Layout - physical arrangement of a tensor's elements
//
// A tensor's Shape is always logical ([batch, channels, height, width] for
// activations). The Layout says in which order those dimensions are laid out
// in the flat storage. Kernels may prefer a specific layout for locality;
// user-visible tensors always use the natural layout for their rank.
//
// Layouts are plain values compared with `==`. The layout negotiator never
// asks the backend whether two layouts match; it only asks the backend which
// layout a kernel prefers, then compares values itself.

/// Physical element order of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Rank-4 row-major [batch, channel, height, width]. The natural order
    /// for 4-d activations and convolution weights.
    Nchw,
    /// Rank-4 channels-last [batch, height, width, channel]. Kernels that
    /// walk channels in their inner loop prefer this.
    Nhwc,
    /// Rank-2 row-major [batch, feature]. The natural order for matrices.
    Nc,
    /// Packed row-major with no dimension-order tag. The natural order for
    /// rank 1, 3, and anything else without a named arrangement.
    X,
}

impl Layout {
    /// The natural (user-facing) layout for a given rank.
    pub fn natural(rank: usize) -> Layout {
        match rank {
            4 => Layout::Nchw,
            2 => Layout::Nc,
            _ => Layout::X,
        }
    }

    /// Natural layout for a shape.
    pub fn natural_for(shape: &Shape) -> Layout {
        Layout::natural(shape.rank())
    }

    /// Whether this layout stores elements in logical row-major order.
    pub fn is_natural(self) -> bool {
        !matches!(self, Layout::Nhwc)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layout::Nchw => "nchw",
            Layout::Nhwc => "nhwc",
            Layout::Nc => "nc",
            Layout::X => "x",
        };
        write!(f, "{}", s)
    }
}
