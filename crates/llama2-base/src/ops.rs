//! Math kernels for the decoder forward pass.
//!
//! Everything operates on contiguous f32 activation buffers. The two
//! matrix-vector products dominate the step cost and fan their output rows
//! out over the transformer's worker pool; the remaining kernels are cheap
//! enough to stay serial.

use rayon::prelude::*;
use rayon::ThreadPool;

const RMS_NORM_EPS: f32 = 1e-5;

/// `out[i] = w[i] * x[i] / sqrt(mean(x^2) + eps)`
pub(crate) fn rms_norm(out: &mut [f32], x: &[f32], w: &[f32]) {
    let mut ss = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    ss = 1.0 / (ss + RMS_NORM_EPS).sqrt();
    for ((o, &xv), &wv) in out.iter_mut().zip(x).zip(w) {
        *o = wv * (ss * xv);
    }
}

/// In-place max-subtracted softmax.
pub(crate) fn softmax(x: &mut [f32]) {
    let max = x.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Rotate consecutive `(q[i], q[i+1])` pairs (and the key row for the pairs
/// that fall inside `kv_dim`) by `pos * freq`, where the frequency depends on
/// the pair's position within its head.
pub(crate) fn rope(q: &mut [f32], k: &mut [f32], pos: usize, head_dim: usize, kv_dim: usize) {
    for i in (0..q.len()).step_by(2) {
        let pair = (i % head_dim) as f32;
        let freq = 1.0 / 10000f32.powf(pair / head_dim as f32);
        let val = pos as f32 * freq;
        let (fci, fcr) = val.sin_cos();

        let (q0, q1) = (q[i], q[i + 1]);
        q[i] = q0 * fcr - q1 * fci;
        q[i + 1] = q0 * fci + q1 * fcr;

        if i < kv_dim {
            let (k0, k1) = (k[i], k[i + 1]);
            k[i] = k0 * fcr - k1 * fci;
            k[i + 1] = k0 * fci + k1 * fcr;
        }
    }
}

/// SwiGLU gate: `hb[i] = hb[i] * sigmoid(hb[i]) * hb2[i]`.
pub(crate) fn swiglu(hb: &mut [f32], hb2: &[f32]) {
    for (h, &h2) in hb.iter_mut().zip(hb2) {
        let silu = *h * (1.0 / (1.0 + (-*h).exp()));
        *h = silu * h2;
    }
}

/// `x += y`
pub(crate) fn accum(x: &mut [f32], y: &[f32]) {
    for (a, &b) in x.iter_mut().zip(y) {
        *a += b;
    }
}

/// Index of the largest value; first index wins ties.
pub(crate) fn argmax(x: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in x.iter().enumerate().skip(1) {
        if v > x[best] {
            best = i;
        }
    }
    best
}

/// Dense matrix-vector product: `out[i] = w[i*n..][..n] . x`, one output row
/// per work item. `w` is row-major `out.len() x x.len()`.
pub(crate) fn matmul(pool: &ThreadPool, out: &mut [f32], x: &[f32], w: &[f32]) {
    let n = x.len();
    debug_assert_eq!(w.len(), out.len() * n);
    pool.install(|| {
        out.par_iter_mut()
            .with_min_len(8)
            .enumerate()
            .for_each(|(i, o)| {
                let row = &w[i * n..(i + 1) * n];
                *o = row.iter().zip(x).map(|(&a, &b)| a * b).sum();
            });
    });
}

/// Quantize `x` to int8 with one absmax scale per `group_size` values.
pub(crate) fn quantize(q: &mut [i8], s: &mut [f32], x: &[f32], group_size: usize) {
    for (g, group) in x.chunks_exact(group_size).enumerate() {
        let wmax = group.iter().fold(0f32, |a, &b| a.max(b.abs()));
        if wmax == 0.0 {
            s[g] = 0.0;
            q[g * group_size..(g + 1) * group_size].fill(0);
            continue;
        }
        let scale = wmax / 127.0;
        s[g] = scale;
        for (qv, &xv) in q[g * group_size..(g + 1) * group_size].iter_mut().zip(group) {
            *qv = (xv / scale).round() as i8;
        }
    }
}

/// Quantized matrix-vector product. `xq`/`xs` are the int8 activation and its
/// per-group scales, `wq`/`ws` the weight payload; integer products accumulate
/// per group and are rescaled into f32.
#[allow(clippy::too_many_arguments)]
pub(crate) fn matmul_q8(
    pool: &ThreadPool,
    out: &mut [f32],
    xq: &[i8],
    xs: &[f32],
    wq: &[i8],
    ws: &[f32],
    n: usize,
    group_size: usize,
) {
    debug_assert_eq!(n % group_size, 0);
    pool.install(|| {
        out.par_iter_mut()
            .with_min_len(8)
            .enumerate()
            .for_each(|(i, o)| {
                let row = &wq[i * n..(i + 1) * n];
                let row_scales = &ws[i * n / group_size..];
                let mut val = 0f32;
                for (g, j) in (0..n).step_by(group_size).enumerate() {
                    let ival: i32 = xq[j..j + group_size]
                        .iter()
                        .zip(&row[j..j + group_size])
                        .map(|(&a, &b)| a as i32 * b as i32)
                        .sum();
                    val += ival as f32 * row_scales[g] * xs[g];
                }
                *o = val;
            });
    });
}
