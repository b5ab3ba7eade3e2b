// 2-d window pooling over channels-first activations.
//
// Pooling touches one channel plane at a time, so nchw keeps every window
// read inside one contiguous plane. Max pooling skips padded positions;
// average pooling divides by the full window size, so padded positions
// contribute zeros to the mean.

use rayon::prelude::*;

use stoat_core::{
    bail, DType, Error, Layout, PoolMode, Result, Shape, Spatial2d, StorageScalar, TensorBuffer,
};

use crate::same_dtype;

pub struct Pool2dOp {
    mode: PoolMode,
    args: Spatial2d,
    src: TensorBuffer,
    dst: TensorBuffer,
}

impl Pool2dOp {
    pub(crate) fn build(
        mode: PoolMode,
        args: &Spatial2d,
        src: &TensorBuffer,
        dst: &TensorBuffer,
    ) -> Result<Self> {
        if src.layout() != Layout::Nchw || dst.layout() != Layout::Nchw {
            bail!(
                "pool2d kernel runs on nchw activations, got src {} / dst {}",
                src.layout(),
                dst.layout()
            );
        }
        if args.kernel[0] == 0 || args.kernel[1] == 0 {
            bail!("pool2d window has a zero side");
        }
        if args.strides[0] == 0 || args.strides[1] == 0 {
            bail!("pool2d stride must be nonzero");
        }
        let sd = src.dims();
        let (batch, channels, in_h, in_w) = (sd[0], sd[1], sd[2], sd[3]);
        if in_h + args.pads[0] + args.pads[2] < args.kernel[0]
            || in_w + args.pads[1] + args.pads[3] < args.kernel[1]
        {
            bail!(
                "pool2d window {}x{} does not fit padded input {}x{}",
                args.kernel[0],
                args.kernel[1],
                in_h + args.pads[0] + args.pads[2],
                in_w + args.pads[1] + args.pads[3]
            );
        }
        let (out_h, out_w) = args.out_hw(in_h, in_w);
        if dst.dims() != [batch, channels, out_h, out_w] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![batch, channels, out_h, out_w]),
                got: dst.shape().clone(),
            });
        }
        same_dtype(&[src, dst])?;

        Ok(Pool2dOp {
            mode,
            args: *args,
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("pool2d cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar + num_traits::Float>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let src = T::slice(&src_guard)?;
        let mut dst_guard = self.dst.write()?;
        let dst = T::slice_mut(&mut dst_guard)?;

        let sd = self.src.dims();
        let (in_h, in_w) = (sd[2], sd[3]);
        let (out_h, out_w) = self.args.out_hw(in_h, in_w);
        let [kh, kw] = self.args.kernel;
        let [sh, sw] = self.args.strides;
        let pad_top = self.args.pads[0] as isize;
        let pad_left = self.args.pads[1] as isize;
        let mode = self.mode;
        let window = T::from_f64((kh * kw) as f64);
        let zero = T::from_f64(0.0);

        // One chunk per channel plane.
        dst.par_chunks_mut(out_h * out_w)
            .enumerate()
            .for_each(|(plane, dplane)| {
                let splane = &src[plane * in_h * in_w..][..in_h * in_w];
                for oy in 0..out_h {
                    let iy0 = (oy * sh) as isize - pad_top;
                    for ox in 0..out_w {
                        let ix0 = (ox * sw) as isize - pad_left;
                        let out = &mut dplane[oy * out_w + ox];
                        match mode {
                            PoolMode::Max => {
                                // A window entirely inside the padding stays -inf.
                                let mut best = T::neg_infinity();
                                for ky in 0..kh {
                                    let iy = iy0 + ky as isize;
                                    if iy < 0 || iy >= in_h as isize {
                                        continue;
                                    }
                                    for kx in 0..kw {
                                        let ix = ix0 + kx as isize;
                                        if ix < 0 || ix >= in_w as isize {
                                            continue;
                                        }
                                        best =
                                            best.max(splane[iy as usize * in_w + ix as usize]);
                                    }
                                }
                                *out = best;
                            }
                            PoolMode::Avg => {
                                let mut sum = zero;
                                for ky in 0..kh {
                                    let iy = iy0 + ky as isize;
                                    if iy < 0 || iy >= in_h as isize {
                                        continue;
                                    }
                                    for kx in 0..kw {
                                        let ix = ix0 + kx as isize;
                                        if ix < 0 || ix >= in_w as isize {
                                            continue;
                                        }
                                        sum = sum + splane[iy as usize * in_w + ix as usize];
                                    }
                                }
                                *out = sum / window;
                            }
                        }
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(data: Vec<f32>, dims: Vec<usize>) -> TensorBuffer {
        TensorBuffer::from_vec(data, dims).unwrap()
    }

    #[test]
    fn test_max_halves_spatial_size() {
        let src = buf((1..=16).map(|v| v as f32).collect(), vec![1, 1, 4, 4]);
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 1, 2, 2], Layout::Nchw).unwrap();
        let args = Spatial2d {
            kernel: [2, 2],
            strides: [2, 2],
            pads: [0, 0, 0, 0],
        };
        let op = Pool2dOp::build(PoolMode::Max, &args, &src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![6.0, 8.0, 14.0, 16.0]);
    }

    #[test]
    fn test_max_ignores_padding() {
        let src = buf(vec![-5.0, -6.0, -7.0, -8.0], vec![1, 1, 2, 2]);
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 1, 2, 2], Layout::Nchw).unwrap();
        let args = Spatial2d {
            kernel: [2, 2],
            strides: [1, 1],
            pads: [1, 1, 0, 0],
        };
        let op = Pool2dOp::build(PoolMode::Max, &args, &src, &dst).unwrap();
        op.execute().unwrap();
        // All inputs are negative; padded zeros must not win the max.
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![-5.0, -5.0, -5.0, -5.0]);
    }

    #[test]
    fn test_avg_counts_padding_in_divisor() {
        let src = buf(vec![4.0, 4.0, 4.0, 4.0], vec![1, 1, 2, 2]);
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 1, 1, 1], Layout::Nchw).unwrap();
        // 3x3 window over a padded 2x2 input: 4 real values, divisor 9.
        let args = Spatial2d {
            kernel: [3, 3],
            strides: [1, 1],
            pads: [0, 0, 1, 1],
        };
        let op = Pool2dOp::build(PoolMode::Avg, &args, &src, &dst).unwrap();
        op.execute().unwrap();
        let got = dst.to_vec::<f32>().unwrap();
        assert!((got[0] - 16.0 / 9.0).abs() < 1e-6);
    }

    #[test]
    fn test_pool_runs_per_plane() {
        // Two images, two channels; each plane pools independently.
        let mut data = Vec::new();
        for plane in 0..4 {
            data.extend([plane as f32, 0.0, 0.0, 0.0]);
        }
        let src = buf(data, vec![2, 2, 2, 2]);
        let dst = TensorBuffer::zeros(DType::F32, vec![2, 2, 1, 1], Layout::Nchw).unwrap();
        let args = Spatial2d {
            kernel: [2, 2],
            strides: [1, 1],
            pads: [0, 0, 0, 0],
        };
        let op = Pool2dOp::build(PoolMode::Max, &args, &src, &dst).unwrap();
        op.execute().unwrap();
        assert_eq!(dst.to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_build_rejects_mismatched_output() {
        let src = buf(vec![0.0; 16], vec![1, 1, 4, 4]);
        let dst = TensorBuffer::zeros(DType::F32, vec![1, 1, 3, 3], Layout::Nchw).unwrap();
        let args = Spatial2d {
            kernel: [2, 2],
            strides: [2, 2],
            pads: [0, 0, 0, 0],
        };
        assert!(matches!(
            Pool2dOp::build(PoolMode::Max, &args, &src, &dst),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
