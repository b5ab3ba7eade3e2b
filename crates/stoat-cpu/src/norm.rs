// Inference batch normalization over channels-first activations.
//
// With fixed statistics the whole transform collapses to one affine map per
// channel: y = a * x + b where a = scale / sqrt(variance + epsilon) and
// b = shift - mean * a. The two coefficient tables are computed once per
// execution, then each channel plane is a scalar multiply-add.

use rayon::prelude::*;

use stoat_core::{bail, DType, Error, Layout, Result, Shape, StorageScalar, TensorBuffer};

use crate::same_dtype;

pub struct BatchNormOp {
    epsilon: f32,
    src: TensorBuffer,
    scale: TensorBuffer,
    shift: TensorBuffer,
    mean: TensorBuffer,
    variance: TensorBuffer,
    dst: TensorBuffer,
}

impl BatchNormOp {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        epsilon: f32,
        src: &TensorBuffer,
        scale: &TensorBuffer,
        shift: &TensorBuffer,
        mean: &TensorBuffer,
        variance: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self> {
        if src.layout() != Layout::Nchw || dst.layout() != Layout::Nchw {
            bail!(
                "batch norm kernel runs on nchw activations, got src {} / dst {}",
                src.layout(),
                dst.layout()
            );
        }
        if dst.shape() != src.shape() {
            return Err(Error::ShapeMismatch {
                expected: src.shape().clone(),
                got: dst.shape().clone(),
            });
        }
        let channels = src.dims()[1];
        for stat in [scale, shift, mean, variance] {
            if stat.rank() != 1 || stat.dims()[0] != channels {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(vec![channels]),
                    got: stat.shape().clone(),
                });
            }
        }
        same_dtype(&[src, scale, shift, mean, variance, dst])?;

        Ok(BatchNormOp {
            epsilon,
            src: src.clone(),
            scale: scale.clone(),
            shift: shift.clone(),
            mean: mean.clone(),
            variance: variance.clone(),
            dst: dst.clone(),
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("batch norm cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar + num_traits::Float>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let scale_guard = self.scale.read()?;
        let shift_guard = self.shift.read()?;
        let mean_guard = self.mean.read()?;
        let var_guard = self.variance.read()?;
        let mut dst_guard = self.dst.write()?;
        let src = T::slice(&src_guard)?;
        let scale = T::slice(&scale_guard)?;
        let shift = T::slice(&shift_guard)?;
        let mean = T::slice(&mean_guard)?;
        let variance = T::slice(&var_guard)?;
        let dst = T::slice_mut(&mut dst_guard)?;

        let sd = self.src.dims();
        let channels = sd[1];
        let plane = sd[2] * sd[3];
        if plane == 0 || channels == 0 {
            return Ok(());
        }

        let eps = T::from_f64(self.epsilon as f64);
        let mut a = Vec::with_capacity(channels);
        let mut b = Vec::with_capacity(channels);
        for c in 0..channels {
            let ac = scale[c] / (variance[c] + eps).sqrt();
            a.push(ac);
            b.push(shift[c] - mean[c] * ac);
        }

        dst.par_chunks_mut(plane)
            .enumerate()
            .for_each(|(idx, dplane)| {
                let c = idx % channels;
                let (ac, bc) = (a[c], b[c]);
                let splane = &src[idx * plane..][..plane];
                for (d, s) in dplane.iter_mut().zip(splane) {
                    *d = *s * ac + bc;
                }
            });
        Ok(())
    }
}
