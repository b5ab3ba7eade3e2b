// Fully-connected (inner product) kernel.
//
// The heavy lifting is one call into the gemm crate per op. Weights are
// stored [out_features, in_features] as models ship them; rather than
// materializing a transpose, the multiply views them through swapped element
// strides. Bias is added row-wise afterwards.

use gemm::{gemm, Parallelism};

use stoat_core::{bail, DType, Error, Result, Shape, StorageScalar, TensorBuffer};

use crate::same_dtype;

/// Scalars the gemm crate can multiply. Implemented for the storable floats;
/// the op dispatches to a concrete instantiation per dtype.
pub(crate) trait GemmScalar: StorageScalar + num_traits::Float {
    /// `dst` [m, n] row-major = `lhs` [m, k] row-major x `rhs` viewed through
    /// the given element strides.
    fn launch_gemm(
        m: usize,
        n: usize,
        k: usize,
        dst: &mut [Self],
        lhs: &[Self],
        rhs: &[Self],
        rhs_cs: isize,
        rhs_rs: isize,
    );
}

macro_rules! instantiate_gemm {
    ($rt:ident) => {
        impl GemmScalar for $rt {
            fn launch_gemm(
                m: usize,
                n: usize,
                k: usize,
                dst: &mut [Self],
                lhs: &[Self],
                rhs: &[Self],
                rhs_cs: isize,
                rhs_rs: isize,
            ) {
                debug_assert_eq!(dst.len(), m * n);
                debug_assert_eq!(lhs.len(), m * k);
                if m == 0 || n == 0 {
                    return;
                }
                if k == 0 {
                    dst.fill(0.0);
                    return;
                }
                let threads = rayon::current_num_threads();
                let parallelism = if threads > 1 {
                    Parallelism::Rayon(threads)
                } else {
                    Parallelism::None
                };
                unsafe {
                    gemm(
                        /* m: usize = */ m,
                        /* n: usize = */ n,
                        /* k: usize = */ k,
                        /* dst: *mut T = */ dst.as_mut_ptr(),
                        /* dst_cs: isize = */ 1,
                        /* dst_rs: isize = */ n as isize,
                        /* read_dst: bool = */ false,
                        /* lhs: *const T = */ lhs.as_ptr(),
                        /* lhs_cs: isize = */ 1,
                        /* lhs_rs: isize = */ k as isize,
                        /* rhs: *const T = */ rhs.as_ptr(),
                        /* rhs_cs: isize = */ rhs_cs,
                        /* rhs_rs: isize = */ rhs_rs,
                        /* alpha: T = */ 0.0,
                        /* beta: T = */ 1.0,
                        /* conj_dst: bool = */ false,
                        /* conj_lhs: bool = */ false,
                        /* conj_rhs: bool = */ false,
                        parallelism,
                    )
                }
            }
        }
    };
}

instantiate_gemm!(f32);
instantiate_gemm!(f64);

pub struct InnerProductOp {
    src: TensorBuffer,
    weights: TensorBuffer,
    bias: TensorBuffer,
    dst: TensorBuffer,
    batch: usize,
    in_features: usize,
    out_features: usize,
}

impl InnerProductOp {
    pub(crate) fn build(
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self> {
        if !src.layout().is_natural() {
            bail!(
                "inner product expects logical-order input, got {}",
                src.layout()
            );
        }
        if src.rank() != 2 && src.rank() != 4 {
            bail!(
                "inner product input must be rank 2 or 4, got {}",
                src.shape()
            );
        }
        let batch = src.dims()[0];
        let in_features: usize = src.dims()[1..].iter().product();

        if weights.rank() != 2 || !weights.layout().is_natural() {
            bail!("inner product weights must be [out, in], got {}", weights.shape());
        }
        let out_features = weights.dims()[0];
        if out_features == 0 {
            bail!("inner product weights have zero output features");
        }
        if weights.dims()[1] != in_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![out_features, in_features]),
                got: weights.shape().clone(),
            });
        }
        if bias.rank() != 1 || bias.dims()[0] != out_features {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![out_features]),
                got: bias.shape().clone(),
            });
        }
        if dst.dims() != [batch, out_features] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![batch, out_features]),
                got: dst.shape().clone(),
            });
        }
        same_dtype(&[src, weights, bias, dst])?;

        Ok(InnerProductOp {
            src: src.clone(),
            weights: weights.clone(),
            bias: bias.clone(),
            dst: dst.clone(),
            batch,
            in_features,
            out_features,
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("inner product cannot run on {dt}"))),
        }
    }

    fn run<T: GemmScalar>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let w_guard = self.weights.read()?;
        let bias_guard = self.bias.read()?;
        let mut dst_guard = self.dst.write()?;
        let src = T::slice(&src_guard)?;
        let weights = T::slice(&w_guard)?;
        let bias = T::slice(&bias_guard)?;
        let dst = T::slice_mut(&mut dst_guard)?;

        let (m, k, n) = (self.batch, self.in_features, self.out_features);
        // dst = src x weights^T; the transpose is expressed through strides.
        T::launch_gemm(m, n, k, dst, src, weights, k as isize, 1);
        for row in dst.chunks_exact_mut(n) {
            for (d, b) in row.iter_mut().zip(bias) {
                *d = *d + *b;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Layout;

    #[test]
    fn test_rows_times_transposed_weights() {
        let src = TensorBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3)).unwrap();
        // Row 0 of the weights picks feature 0, row 1 picks feature 2.
        let weights =
            TensorBuffer::from_vec(vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0], (2, 3)).unwrap();
        let bias = TensorBuffer::from_vec(vec![0.5f32, -0.5], vec![2usize]).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (2, 2), Layout::Nc).unwrap();
        let op = InnerProductOp::build(&src, &weights, &bias, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![1.5, 2.5, 4.5, 5.5]);
    }

    #[test]
    fn test_rank_four_input_flattens() {
        let src = TensorBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], vec![1, 2, 1, 2]).unwrap();
        let weights = TensorBuffer::from_vec(vec![1.0f32; 4], (1, 4)).unwrap();
        let bias = TensorBuffer::from_vec(vec![1.0f32], vec![1usize]).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (1, 1), Layout::Nc).unwrap();
        let op = InnerProductOp::build(&src, &weights, &bias, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![11.0]);
    }

    #[test]
    fn test_f64_path() {
        let src = TensorBuffer::from_vec(vec![2.0f64], (1, 1)).unwrap();
        let weights = TensorBuffer::from_vec(vec![3.0f64], (1, 1)).unwrap();
        let bias = TensorBuffer::from_vec(vec![1.0f64], vec![1usize]).unwrap();
        let dst = TensorBuffer::zeros(DType::F64, (1, 1), Layout::Nc).unwrap();
        let op = InnerProductOp::build(&src, &weights, &bias, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f64>().unwrap(), vec![7.0]);
    }

    #[test]
    fn test_build_rejects_feature_mismatch() {
        let src = TensorBuffer::from_vec(vec![0.0f32; 6], (2, 3)).unwrap();
        let weights = TensorBuffer::from_vec(vec![0.0f32; 8], (2, 4)).unwrap();
        let bias = TensorBuffer::from_vec(vec![0.0f32; 2], vec![2usize]).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (2, 2), Layout::Nc).unwrap();
        assert!(matches!(
            InnerProductOp::build(&src, &weights, &bias, &dst),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
