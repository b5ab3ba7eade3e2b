// Element-wise activations. Layout-blind: the function is applied per
// element in whatever order the buffer stores them, so src and dst must
// carry the same shape and layout.

use rayon::prelude::*;

use stoat_core::{bail, DType, EltwiseFunc, Error, Result, StorageScalar, TensorBuffer};

use crate::same_dtype;

const PAR_CHUNK: usize = 8192;

pub struct EltwiseOp {
    func: EltwiseFunc,
    src: TensorBuffer,
    dst: TensorBuffer,
}

impl EltwiseOp {
    pub(crate) fn build(func: EltwiseFunc, src: &TensorBuffer, dst: &TensorBuffer) -> Result<Self> {
        if src.shape() != dst.shape() {
            return Err(Error::ShapeMismatch {
                expected: src.shape().clone(),
                got: dst.shape().clone(),
            });
        }
        if src.layout() != dst.layout() {
            bail!(
                "eltwise src and dst must share a layout, got {} / {}",
                src.layout(),
                dst.layout()
            );
        }
        same_dtype(&[src, dst])?;
        Ok(EltwiseOp {
            func,
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("eltwise cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar + num_traits::Float>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let src = T::slice(&src_guard)?;
        let mut dst_guard = self.dst.write()?;
        let dst = T::slice_mut(&mut dst_guard)?;
        let func = self.func;

        dst.par_chunks_mut(PAR_CHUNK)
            .zip(src.par_chunks(PAR_CHUNK))
            .for_each(|(dchunk, schunk)| {
                for (d, s) in dchunk.iter_mut().zip(schunk) {
                    *d = apply(func, *s);
                }
            });
        Ok(())
    }
}

fn apply<T: StorageScalar + num_traits::Float>(func: EltwiseFunc, x: T) -> T {
    let zero = T::from_f64(0.0);
    match func {
        EltwiseFunc::Relu => {
            if x > zero {
                x
            } else {
                zero
            }
        }
        EltwiseFunc::LeakyRelu { alpha } => {
            if x > zero {
                x
            } else {
                T::from_f64(alpha as f64) * x
            }
        }
        EltwiseFunc::Elu { alpha } => {
            if x > zero {
                x
            } else {
                T::from_f64(alpha as f64) * (x.exp() - T::one())
            }
        }
        EltwiseFunc::Tanh => x.tanh(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::Layout;

    fn run(func: EltwiseFunc, input: Vec<f32>) -> Vec<f32> {
        let n = input.len();
        let src = TensorBuffer::from_vec(input, (1, n)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (1, n), Layout::Nc).unwrap();
        let op = EltwiseOp::build(func, &src, &dst).unwrap();
        op.execute().unwrap();
        dst.to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_relu_clamps_negatives() {
        assert_eq!(
            run(EltwiseFunc::Relu, vec![-2.0, -0.0, 0.5, 3.0]),
            vec![0.0, 0.0, 0.5, 3.0]
        );
    }

    #[test]
    fn test_leaky_relu_scales_negatives() {
        let got = run(EltwiseFunc::LeakyRelu { alpha: 0.1 }, vec![-2.0, 4.0]);
        assert!((got[0] + 0.2).abs() < 1e-6);
        assert_eq!(got[1], 4.0);
    }

    #[test]
    fn test_elu_is_smooth_at_zero() {
        let got = run(EltwiseFunc::Elu { alpha: 1.0 }, vec![-1.0, 0.0, 1.0]);
        assert!((got[0] - (f32::exp(-1.0) - 1.0)).abs() < 1e-6);
        assert_eq!(got[1], 0.0);
        assert_eq!(got[2], 1.0);
    }

    #[test]
    fn test_tanh_matches_std() {
        let got = run(EltwiseFunc::Tanh, vec![-0.5, 0.0, 0.5]);
        assert!((got[0] - (-0.5f32).tanh()).abs() < 1e-6);
        assert_eq!(got[1], 0.0);
        assert!((got[2] - 0.5f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_build_rejects_shape_mismatch() {
        let src = TensorBuffer::from_vec(vec![0.0f32; 4], (2, 2)).unwrap();
        let dst = TensorBuffer::zeros(DType::F32, (1, 4), Layout::Nc).unwrap();
        assert!(EltwiseOp::build(EltwiseFunc::Relu, &src, &dst).is_err());
    }
}
