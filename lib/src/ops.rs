//! Forward and backward kernels for the layers of the feature network and the
//! loss terms built on top of it.
//!
//! Only gradients with respect to layer *inputs* are ever computed, the
//! network weights are frozen.

use crate::{
    tensor::{Shape, Tensor},
    Error,
};

/// Splits `out` into chunks of whole planes (`plane` elements each) and runs
/// `f(first_plane_index, chunk)` on up to `max_threads` workers.
///
/// Every output element is written by exactly one worker, so the result does
/// not depend on the number of threads.
fn for_each_plane_chunk<F>(out: &mut [f32], plane: usize, max_threads: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    let planes = if plane == 0 { 0 } else { out.len() / plane };
    let workers = max_threads.max(1).min(planes.max(1));

    // for WASM we do not have threads and crossbeam panics,
    // so let's just run the work on the current thread
    #[cfg(target_arch = "wasm32")]
    {
        let _ = workers;
        f(0, out);
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        if workers <= 1 {
            f(0, out);
            return;
        }

        let per_worker = (planes + workers - 1) / workers;
        let f = &f;
        let result = crossbeam_utils::thread::scope(|scope| {
            for (i, chunk) in out.chunks_mut(per_worker * plane).enumerate() {
                scope.spawn(move |_| f(i * per_worker, chunk));
            }
        });

        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}

/// `dst[y][x] += weight * src[y + dy][x + dx]` for every position where the
/// source coordinate is inside the `h x w` plane.
#[inline]
fn accumulate_shifted(
    dst: &mut [f32],
    src: &[f32],
    (h, w): (usize, usize),
    (dy, dx): (isize, isize),
    weight: f32,
) {
    let (hi, wi) = (h as isize, w as isize);
    let y0 = (-dy).max(0);
    let y1 = (hi - dy).min(hi);
    let x0 = (-dx).max(0);
    let x1 = (wi - dx).min(wi);

    if y0 >= y1 || x0 >= x1 {
        return;
    }

    let run = (x1 - x0) as usize;
    for y in y0..y1 {
        let d_start = (y * wi + x0) as usize;
        let s_start = ((y + dy) * wi + x0 + dx) as usize;

        let d = &mut dst[d_start..d_start + run];
        let s = &src[s_start..s_start + run];
        for (a, b) in d.iter_mut().zip(s.iter()) {
            *a += weight * *b;
        }
    }
}

/// 2D convolution with stride 1 and "same" zero padding (`kernel / 2`).
///
/// `weight` is laid out `[out_channels, in_channels, kernel, kernel]` as in
/// torchvision checkpoints.
pub(crate) fn conv2d(
    input: &Tensor,
    weight: &[f32],
    bias: &[f32],
    out_channels: usize,
    kernel: usize,
    max_threads: usize,
) -> Tensor {
    let in_shape = input.shape();
    let (h, w) = (in_shape.height, in_shape.width);
    let in_channels = in_shape.channels;
    let pad = (kernel / 2) as isize;
    let kk = kernel * kernel;

    let mut out = Tensor::zeros(Shape::new(out_channels, h, w));
    let src = input.as_slice();

    for_each_plane_chunk(out.as_mut_slice(), h * w, max_threads, |first, chunk| {
        for (i, plane) in chunk.chunks_mut(h * w).enumerate() {
            let co = first + i;
            for v in plane.iter_mut() {
                *v = bias[co];
            }

            for ci in 0..in_channels {
                let src_plane = &src[ci * h * w..(ci + 1) * h * w];
                let kernel_weights = &weight[(co * in_channels + ci) * kk..(co * in_channels + ci + 1) * kk];

                for ky in 0..kernel {
                    for kx in 0..kernel {
                        accumulate_shifted(
                            plane,
                            src_plane,
                            (h, w),
                            (ky as isize - pad, kx as isize - pad),
                            kernel_weights[ky * kernel + kx],
                        );
                    }
                }
            }
        }
    });

    out
}

/// Gradient of [`conv2d`] with respect to its input.
pub(crate) fn conv2d_backward(
    grad_out: &Tensor,
    weight: &[f32],
    in_channels: usize,
    kernel: usize,
    max_threads: usize,
) -> Tensor {
    let out_shape = grad_out.shape();
    let (h, w) = (out_shape.height, out_shape.width);
    let out_channels = out_shape.channels;
    let pad = (kernel / 2) as isize;
    let kk = kernel * kernel;

    let mut grad_in = Tensor::zeros(Shape::new(in_channels, h, w));
    let g = grad_out.as_slice();

    for_each_plane_chunk(grad_in.as_mut_slice(), h * w, max_threads, |first, chunk| {
        for (i, plane) in chunk.chunks_mut(h * w).enumerate() {
            let ci = first + i;

            for co in 0..out_channels {
                let g_plane = &g[co * h * w..(co + 1) * h * w];
                let kernel_weights = &weight[(co * in_channels + ci) * kk..(co * in_channels + ci + 1) * kk];

                for ky in 0..kernel {
                    for kx in 0..kernel {
                        accumulate_shifted(
                            plane,
                            g_plane,
                            (h, w),
                            (pad - ky as isize, pad - kx as isize),
                            kernel_weights[ky * kernel + kx],
                        );
                    }
                }
            }
        }
    });

    grad_in
}

pub(crate) fn relu(input: &Tensor) -> Tensor {
    let mut out = input.clone();
    for v in out.as_mut_slice() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
    out
}

pub(crate) fn relu_backward(input: &Tensor, grad_out: &Tensor) -> Tensor {
    let mut grad_in = grad_out.clone();
    for (g, x) in grad_in.as_mut_slice().iter_mut().zip(input.as_slice()) {
        if *x <= 0.0 {
            *g = 0.0;
        }
    }
    grad_in
}

/// Shape after a 2x2 pool with stride 2, partial windows are dropped
#[inline]
pub(crate) fn pooled_shape(shape: Shape) -> Shape {
    Shape::new(shape.channels, shape.height / 2, shape.width / 2)
}

/// Offset (0..4) of the first maximum in the 2x2 window at `(oy, ox)`
#[inline]
fn window_argmax(plane: &[f32], w: usize, oy: usize, ox: usize) -> (usize, f32) {
    let base = 2 * oy * w + 2 * ox;
    let window = [plane[base], plane[base + 1], plane[base + w], plane[base + w + 1]];

    let mut best = 0;
    for (i, v) in window.iter().enumerate().skip(1) {
        // NaN never wins, so an all-NaN window keeps the first element
        if *v > window[best] {
            best = i;
        }
    }
    (best, window[best])
}

pub(crate) fn max_pool2d(input: &Tensor) -> Tensor {
    let in_shape = input.shape();
    let out_shape = pooled_shape(in_shape);
    let mut out = Tensor::zeros(out_shape);

    for c in 0..in_shape.channels {
        let plane = input.channel(c);
        let dst = &mut out.as_mut_slice()[c * out_shape.plane()..(c + 1) * out_shape.plane()];
        for oy in 0..out_shape.height {
            for ox in 0..out_shape.width {
                dst[oy * out_shape.width + ox] = window_argmax(plane, in_shape.width, oy, ox).1;
            }
        }
    }

    out
}

pub(crate) fn max_pool2d_backward(input: &Tensor, grad_out: &Tensor) -> Tensor {
    let in_shape = input.shape();
    let out_shape = grad_out.shape();
    let w = in_shape.width;
    let mut grad_in = Tensor::zeros(in_shape);

    for c in 0..in_shape.channels {
        let plane = input.channel(c);
        let g = grad_out.channel(c);
        let dst = &mut grad_in.as_mut_slice()[c * in_shape.plane()..(c + 1) * in_shape.plane()];

        for oy in 0..out_shape.height {
            for ox in 0..out_shape.width {
                let (best, _) = window_argmax(plane, w, oy, ox);
                let idx = (2 * oy + best / 2) * w + 2 * ox + best % 2;
                dst[idx] += g[oy * out_shape.width + ox];
            }
        }
    }

    grad_in
}

pub(crate) fn avg_pool2d(input: &Tensor) -> Tensor {
    let in_shape = input.shape();
    let out_shape = pooled_shape(in_shape);
    let w = in_shape.width;
    let mut out = Tensor::zeros(out_shape);

    for c in 0..in_shape.channels {
        let plane = input.channel(c);
        let dst = &mut out.as_mut_slice()[c * out_shape.plane()..(c + 1) * out_shape.plane()];
        for oy in 0..out_shape.height {
            for ox in 0..out_shape.width {
                let base = 2 * oy * w + 2 * ox;
                dst[oy * out_shape.width + ox] =
                    (plane[base] + plane[base + 1] + plane[base + w] + plane[base + w + 1]) * 0.25;
            }
        }
    }

    out
}

pub(crate) fn avg_pool2d_backward(in_shape: Shape, grad_out: &Tensor) -> Tensor {
    let out_shape = grad_out.shape();
    let w = in_shape.width;
    let mut grad_in = Tensor::zeros(in_shape);

    for c in 0..in_shape.channels {
        let g = grad_out.channel(c);
        let dst = &mut grad_in.as_mut_slice()[c * in_shape.plane()..(c + 1) * in_shape.plane()];
        for oy in 0..out_shape.height {
            for ox in 0..out_shape.width {
                let v = g[oy * out_shape.width + ox] * 0.25;
                let base = 2 * oy * w + 2 * ox;
                dst[base] += v;
                dst[base + 1] += v;
                dst[base + w] += v;
                dst[base + w + 1] += v;
            }
        }
    }

    grad_in
}

/// A `C x C` channel correlation matrix, the style descriptor of a feature
/// activation.
#[derive(Clone, Debug, PartialEq)]
pub struct Gram {
    channels: usize,
    data: Vec<f32>,
}

impl Gram {
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.channels + j]
    }

    /// Row-major entries
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Computes the Gram matrix of a `(1, C, H, W)` feature activation, normalized
/// by `C * H * W` so that layers of different resolution contribute
/// comparable magnitudes.
///
/// ```
/// use neural_style::{gram, Tensor};
///
/// let g = gram(&Tensor::solid(2, 2, [1.0, 0.5, 0.0])).unwrap();
/// assert_eq!(g.channels(), 3);
/// assert_eq!(g.get(0, 1), g.get(1, 0));
/// ```
pub fn gram(features: &Tensor) -> Result<Gram, Error> {
    let shape = features.shape();
    if shape.is_empty() {
        return Err(Error::EmptyFeatureMap(format!(
            "{}x{}x{}",
            shape.channels, shape.height, shape.width
        )));
    }

    Ok(gram_matrix(features, 1))
}

/// [`gram`] for shapes that are already known to be non-empty
pub(crate) fn gram_matrix(features: &Tensor, max_threads: usize) -> Gram {
    let shape = features.shape();
    let channels = shape.channels;
    let norm = shape.len() as f64;

    let mut data = vec![0.0; channels * channels];
    for_each_plane_chunk(&mut data, channels, max_threads, |first, chunk| {
        for (r, row) in chunk.chunks_mut(channels).enumerate() {
            let fi = features.channel(first + r);
            for (j, out) in row.iter_mut().enumerate() {
                let fj = features.channel(j);
                let dot: f64 = fi
                    .iter()
                    .zip(fj.iter())
                    .map(|(a, b)| f64::from(*a) * f64::from(*b))
                    .sum();
                *out = (dot / norm) as f32;
            }
        }
    });

    Gram { channels, data }
}

/// Gradient of [`gram_matrix`] with respect to the features, given the
/// gradient of the loss with respect to every Gram entry.
pub(crate) fn gram_backward(features: &Tensor, grad_gram: &[f32], max_threads: usize) -> Tensor {
    let shape = features.shape();
    let channels = shape.channels;
    let plane = shape.plane();
    let norm = shape.len() as f32;

    let mut grad = Tensor::zeros(shape);
    for_each_plane_chunk(grad.as_mut_slice(), plane, max_threads, |first, chunk| {
        for (r, dst) in chunk.chunks_mut(plane).enumerate() {
            let i = first + r;
            for j in 0..channels {
                let coef = (grad_gram[i * channels + j] + grad_gram[j * channels + i]) / norm;
                if coef == 0.0 {
                    continue;
                }
                for (d, f) in dst.iter_mut().zip(features.channel(j).iter()) {
                    *d += coef * *f;
                }
            }
        }
    });

    grad
}

/// Mean squared error between `live` and `target`, together with its gradient
/// with respect to `live` scaled by `scale`.
pub(crate) fn mse_with_grad(live: &[f32], target: &[f32], scale: f32) -> (f32, Vec<f32>) {
    debug_assert_eq!(live.len(), target.len());
    let n = live.len() as f64;

    let mut sum = 0.0f64;
    let mut grad = Vec::with_capacity(live.len());
    let factor = (2.0 / n) as f32 * scale;
    for (a, b) in live.iter().zip(target.iter()) {
        let diff = a - b;
        sum += f64::from(diff) * f64::from(diff);
        grad.push(factor * diff);
    }

    ((sum / n) as f32, grad)
}
