// Direct 2-d convolution over channels-last activations.
//
// The kernel reads one input pixel across all channels at a time, which is
// why the backend asks for nhwc on both sides: the per-pixel channel vector
// is then contiguous and the inner accumulation loop runs over adjacent
// elements of both the activation and the packed weights.
//
// Weights arrive in their logical [O, C, kH, kW] order and are repacked once
// at build time into [kH, kW, O, C], so each (ky, kx, oc) triple owns a
// contiguous row of C weights.

use rayon::prelude::*;

use stoat_core::{
    bail, DType, Error, Layout, Result, Shape, Spatial2d, Storage, StorageScalar, TensorBuffer,
};

use crate::same_dtype;

pub struct Conv2dOp {
    src: TensorBuffer,
    packed_weights: Storage,
    bias: Option<TensorBuffer>,
    dst: TensorBuffer,
    args: Spatial2d,
}

impl Conv2dOp {
    pub(crate) fn build(
        args: &Spatial2d,
        src: &TensorBuffer,
        weights: &TensorBuffer,
        bias: Option<&TensorBuffer>,
        dst: &TensorBuffer,
    ) -> Result<Self> {
        if src.layout() != Layout::Nhwc || dst.layout() != Layout::Nhwc {
            bail!(
                "conv2d kernel runs on nhwc activations, got src {} / dst {}",
                src.layout(),
                dst.layout()
            );
        }
        if !weights.layout().is_natural() || weights.rank() != 4 {
            bail!("conv2d weights must be [o, c, kh, kw], got {}", weights.shape());
        }
        if args.kernel[0] == 0 || args.kernel[1] == 0 {
            bail!("conv2d kernel window has a zero side");
        }
        if args.strides[0] == 0 || args.strides[1] == 0 {
            bail!("conv2d stride must be nonzero");
        }

        let sd = src.dims();
        let (batch, in_c, in_h, in_w) = (sd[0], sd[1], sd[2], sd[3]);
        let wd = weights.dims();
        let (out_c, w_in_c, kh, kw) = (wd[0], wd[1], wd[2], wd[3]);
        if out_c == 0 || w_in_c == 0 {
            bail!("conv2d weights have a zero channel dimension: {}", weights.shape());
        }
        if w_in_c != in_c || [kh, kw] != args.kernel {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![out_c, in_c, args.kernel[0], args.kernel[1]]),
                got: weights.shape().clone(),
            });
        }
        if in_h + args.pads[0] + args.pads[2] < kh || in_w + args.pads[1] + args.pads[3] < kw {
            bail!(
                "conv2d window {}x{} does not fit padded input {}x{}",
                kh,
                kw,
                in_h + args.pads[0] + args.pads[2],
                in_w + args.pads[1] + args.pads[3]
            );
        }
        let (out_h, out_w) = args.out_hw(in_h, in_w);
        if dst.dims() != [batch, out_c, out_h, out_w] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(vec![batch, out_c, out_h, out_w]),
                got: dst.shape().clone(),
            });
        }
        if let Some(b) = bias {
            if b.rank() != 1 || b.dims()[0] != out_c {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(vec![out_c]),
                    got: b.shape().clone(),
                });
            }
        }
        let mut all = vec![src, weights, dst];
        all.extend(bias);
        same_dtype(&all)?;

        Ok(Conv2dOp {
            src: src.clone(),
            packed_weights: pack_weights(weights, out_c, in_c, kh, kw)?,
            bias: bias.cloned(),
            dst: dst.clone(),
            args: *args,
        })
    }

    pub(crate) fn execute(&self) -> Result<()> {
        match self.dst.dtype() {
            DType::F32 => self.run::<f32>(),
            DType::F64 => self.run::<f64>(),
            dt => Err(Error::msg(format!("conv2d cannot run on {dt}"))),
        }
    }

    fn run<T: StorageScalar + num_traits::Float>(&self) -> Result<()> {
        let src_guard = self.src.read()?;
        let src = T::slice(&src_guard)?;
        let weights = T::slice(&self.packed_weights)?;
        let bias_guard = match &self.bias {
            Some(b) => Some(b.read()?),
            None => None,
        };
        let bias: Option<&[T]> = match &bias_guard {
            Some(g) => Some(T::slice(g)?),
            None => None,
        };
        let mut dst_guard = self.dst.write()?;
        let dst = T::slice_mut(&mut dst_guard)?;

        let sd = self.src.dims();
        let (in_c, in_h, in_w) = (sd[1], sd[2], sd[3]);
        let out_c = self.dst.dims()[1];
        let (out_h, out_w) = self.args.out_hw(in_h, in_w);
        let [kh, kw] = self.args.kernel;
        let [sh, sw] = self.args.strides;
        let pad_top = self.args.pads[0] as isize;
        let pad_left = self.args.pads[1] as isize;
        let zero = T::from_f64(0.0);

        // One chunk per output row of one image.
        dst.par_chunks_mut(out_w * out_c)
            .enumerate()
            .for_each(|(row, drow)| {
                let n = row / out_h;
                let oy = row % out_h;
                let iy0 = (oy * sh) as isize - pad_top;
                for ox in 0..out_w {
                    let opix = &mut drow[ox * out_c..(ox + 1) * out_c];
                    match bias {
                        Some(b) => opix.copy_from_slice(b),
                        None => opix.fill(zero),
                    }
                    let ix0 = (ox * sw) as isize - pad_left;
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
                            let spix = &src
                                [((n * in_h + iy as usize) * in_w + ix as usize) * in_c..][..in_c];
                            let wbase = (ky * kw + kx) * out_c * in_c;
                            for (oc, acc) in opix.iter_mut().enumerate() {
                                let wrow = &weights[wbase + oc * in_c..][..in_c];
                                let mut sum = zero;
                                for (s, w) in spix.iter().zip(wrow) {
                                    sum = sum + *s * *w;
                                }
                                *acc = *acc + sum;
                            }
                        }
                    }
                }
            });
        Ok(())
    }
}

fn pack_weights(
    weights: &TensorBuffer,
    out_c: usize,
    in_c: usize,
    kh: usize,
    kw: usize,
) -> Result<Storage> {
    let guard = weights.read()?;
    Ok(match &*guard {
        Storage::F32(v) => Storage::F32(pack(v, out_c, in_c, kh, kw)),
        Storage::F64(v) => Storage::F64(pack(v, out_c, in_c, kh, kw)),
    })
}

// [o, c, ky, kx] -> [ky, kx, o, c]
fn pack<T: Copy + Default>(w: &[T], out_c: usize, in_c: usize, kh: usize, kw: usize) -> Vec<T> {
    let mut packed = vec![T::default(); w.len()];
    for oc in 0..out_c {
        for ic in 0..in_c {
            for ky in 0..kh {
                for kx in 0..kw {
                    packed[((ky * kw + kx) * out_c + oc) * in_c + ic] =
                        w[((oc * in_c + ic) * kh + ky) * kw + kx];
                }
            }
        }
    }
    packed
}
