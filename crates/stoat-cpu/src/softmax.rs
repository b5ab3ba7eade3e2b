// Row softmax. The input is treated as [batch, features] with any trailing
// dims folded into the feature axis; each row is shifted by its maximum
// before exponentiation so large logits cannot overflow.

use rayon::prelude::*;

use stoat_core::{bail, DType, Error, Result, StorageScalar, TensorBuffer};

use crate::same_dtype;

pub struct SoftmaxOp {
    src: TensorBuffer,
    dst: TensorBuffer,
}

impl SoftmaxOp {
    pub(crate) fn build(src: &TensorBuffer, dst: &TensorBuffer) -> Result<Self> {
        if !src.layout().is_natural() || !dst.layout().is_natural() {
            bail!(
                "softmax expects logical-order buffers, got src {} / dst {}",
                src.layout(),
                dst.layout()
            );
        }
        if src.rank() < 2 {
            bail!("softmax needs a batch dimension, got {}", src.shape());
        }
        if src.shape() != dst.shape() {
            return Err(Error::ShapeMismatch {
                expected: src.shape().clone(),
                got: dst.shape().clone(),
            });
        }
        same_dtype(&[src, dst])?;
        Ok(SoftmaxOp {
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("softmax cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar + num_traits::Float>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let src = T::slice(&src_guard)?;
        let mut dst_guard = self.dst.write()?;
        let dst = T::slice_mut(&mut dst_guard)?;

        let cols: usize = self.src.dims()[1..].iter().product();
        if cols == 0 {
            return Ok(());
        }

        dst.par_chunks_mut(cols)
            .enumerate()
            .for_each(|(row, drow)| {
                let srow = &src[row * cols..][..cols];
                let mut max = T::neg_infinity();
                for &v in srow {
                    max = max.max(v);
                }
                let mut sum = T::from_f64(0.0);
                for (d, &s) in drow.iter_mut().zip(srow) {
                    let e = (s - max).exp();
                    *d = e;
                    sum = sum + e;
                }
                let inv = T::one() / sum;
                for d in drow.iter_mut() {
                    *d = *d * inv;
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Layout;

    #[test]
    fn test_rows_sum_to_one() {
        let src =
            TensorBuffer::from_vec(vec![1.0f32, 2.0, 3.0, -1.0, 0.0, 1.0], (2, 3)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (2, 3), Layout::Nc).unwrap();
        let op = SoftmaxOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        let got = dst.to_vec::<f32>().unwrap();
        for row in got.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(row.windows(2).all(|w| w[0] < w[1]));
        }
        // Shifting a row by a constant must not change its softmax.
        assert!((got[0] - got[3]).abs() < 1e-6);
    }

    #[test]
    fn test_large_logits_do_not_overflow() {
        let src = TensorBuffer::from_vec(vec![1000.0f32, 1000.0], (1, 2)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (1, 2), Layout::Nc).unwrap();
        let op = SoftmaxOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        let got = dst.to_vec::<f32>().unwrap();
        assert!((got[0] - 0.5).abs() < 1e-6);
        assert!((got[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_trailing_dims_fold_into_features() {
        // [1, 2, 1, 2] softmaxes over all four values at once.
        let src = TensorBuffer::from_vec(vec![0.0f32, 0.0, 0.0, 0.0], vec![1, 2, 1, 2]).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 2, 1, 2], Layout::Nchw).unwrap();
        let op = SoftmaxOp::build(&src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![0.25; 4]);
    }

    #[test]
    fn test_build_rejects_rank_one() {
        let src = TensorBuffer::from_vec(vec![1.0f32, 2.0], vec![2usize]).unwrap();
        let dst = TensorBuffer::from_vec(vec![0.0f32, 0.0], vec![2usize]).unwrap();
        assert!(SoftmaxOp::build(&src, &dst).is_err());
    }
}
