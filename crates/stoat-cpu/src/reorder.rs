// Logical-order copy between buffers.
//
// One kernel covers three jobs: converting between channels-last and
// logical-order storage, materializing a reshape into a fresh buffer, and
// plain same-shape copies. In every case the rule is the same: the
// destination receives the source's elements in logical (row-major nchw)
// order, whatever physical order either side uses.

use rayon::prelude::*;

use stoat_core::{bail, DType, Error, Layout, Result, StorageScalar, TensorBuffer};

use crate::same_dtype;

pub struct ReorderOp {
    src: TensorBuffer,
    dst: TensorBuffer,
}

impl ReorderOp {
    pub(crate) fn build(src: &TensorBuffer, dst: &TensorBuffer) -> Result<Self> {
        if src.elem_count() != dst.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: dst.shape().clone(),
                expected: dst.elem_count(),
                got: src.elem_count(),
            });
        }
        if src.layout() == Layout::Nhwc
            && dst.layout() == Layout::Nhwc
            && src.shape() != dst.shape()
        {
            bail!(
                "cannot reorder between channels-last shapes {} and {}",
                src.shape(),
                dst.shape()
            );
        }
        same_dtype(&[src, dst])?;
        Ok(ReorderOp {
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("reorder cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let src = T::slice(&src_guard)?;
        let mut dst_guard = self.dst.write()?;
        let dst = T::slice_mut(&mut dst_guard)?;

        match (self.src.layout(), self.dst.layout()) {
            // Identical physical order on both sides.
            (Layout::Nhwc, Layout::Nhwc) => dst.copy_from_slice(src),
            (Layout::Nhwc, _) => from_channels_last(src, dst, self.src.dims()),
            (_, Layout::Nhwc) => into_channels_last(src, dst, self.dst.dims()),
            // Both sides already store logical order; shapes may differ.
            _ => dst.copy_from_slice(src),
        }
        Ok(())
    }
}

fn from_channels_last<T: Copy + Send + Sync>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let (c, h, w) = (dims[1], dims[2], dims[3]);
    let plane = h * w;
    if plane == 0 || c == 0 {
        return;
    }
    dst.par_chunks_mut(plane).enumerate().for_each(|(idx, dplane)| {
        let (n, ch) = (idx / c, idx % c);
        let sbase = n * plane * c;
        for y in 0..h {
            for x in 0..w {
                dplane[y * w + x] = src[sbase + (y * w + x) * c + ch];
            }
        }
    });
}

fn into_channels_last<T: Copy + Send + Sync>(src: &[T], dst: &mut [T], dims: &[usize]) {
    let (c, h, w) = (dims[1], dims[2], dims[3]);
    let row = w * c;
    if row == 0 || h == 0 {
        return;
    }
    dst.par_chunks_mut(row).enumerate().for_each(|(idx, drow)| {
        let (n, y) = (idx / h, idx % h);
        for x in 0..w {
            for ch in 0..c {
                drow[x * c + ch] = src[((n * c + ch) * h + y) * w + x];
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_copy() {
        let src = TensorBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (2, 2), Layout::Nc).unwrap();
        let op = ReorderOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reshape_copy_between_logical_shapes() {
        let src = TensorBuffer::from_vec((0..12).map(|v| v as f32).collect(), (2, 6)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, vec![3, 4], Layout::Nc).unwrap();
        let op = ReorderOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(
            dst.to_vec::<f32>().unwrap(),
            (0..12).map(|v| v as f32).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_channels_last_to_logical() {
        // Physical nhwc [1,2,2,2]: pixels hold (c0, c1) pairs.
        let src = TensorBuffer::zeros(DType::F32, vec![1, 2, 2, 2], Layout::Nhwc).unwrap();
        src.copy_from_slice(&[1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0])
            .unwrap();
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 2, 2, 2], Layout::Nchw).unwrap();
        let op = ReorderOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(
            dst.to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]
        );
    }

    #[test]
    fn test_logical_to_channels_last() {
        let src = TensorBuffer::from_vec(
            vec![1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0],
            vec![1, 2, 2, 2],
        )
        .unwrap();
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 2, 2, 2], Layout::Nhwc).unwrap();
        let op = ReorderOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(
            dst.to_vec::<f32>().unwrap(),
            vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]
        );
    }

    #[test]
    fn test_batched_conversion() {
        // Image 1 is image 0 plus 100; conversion must keep images apart.
        let mut logical = Vec::new();
        for img in 0..2 {
            for v in [1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0] {
                logical.push(v + 100.0 * img as f32);
            }
        }
        let src = TensorBuffer::from_vec(logical.clone(), vec![2, 2, 2, 2]).unwrap();
        let nhwc = TensorBuffer::zeros(DType::F32, vec![2, 2, 2, 2], Layout::Nhwc).unwrap();
        let back = TensorBuffer::zeros(DType::F32, vec![2, 2, 2, 2], Layout::Nchw).unwrap();
        ReorderOp::build(&src, &nhwc).unwrap().execute().unwrap();
        ReorderOp::build(&nhwc, &back).unwrap().execute().unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), logical);
    }

    #[test]
    fn test_build_rejects_count_mismatch() {
        let src = TensorBuffer::from_vec(vec![0.0f32; 4], (2, 2)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (2, 3), Layout::Nc).unwrap();
        assert!(matches!(
            ReorderOp::build(&src, &dst),
            Err(Error::ElementCountMismatch { .. })
        ));
    }
}
