//! Image primitives on the evaluator's hot path.
//!
//! All operate on preallocated HWC arrays so the per-frame loop allocates
//! nothing. The batch tensor is NCHW float32.

use ndarray::{Array3, Array4};

/// Fused NV12 → BGR conversion (full-range BT.601), canonical input pitch.
pub fn nv12_to_bgr(y_plane: &[u8], uv_plane: &[u8], width: u32, height: u32, out: &mut Array3<u8>) {
    let w = width as usize;
    let h = height as usize;
    debug_assert_eq!(out.dim(), (h, w, 3));

    for row in 0..h {
        for col in 0..w {
            let luma = y_plane[row * w + col] as f32;
            let uv_base = (row / 2) * w + 2 * (col / 2);
            let cb = uv_plane[uv_base] as f32 - 128.0;
            let cr = uv_plane[uv_base + 1] as f32 - 128.0;

            let r = luma + 1.402 * cr;
            let g = luma - 0.344_136 * cb - 0.714_136 * cr;
            let b = luma + 1.772 * cb;

            out[(row, col, 0)] = b.clamp(0.0, 255.0) as u8;
            out[(row, col, 1)] = g.clamp(0.0, 255.0) as u8;
            out[(row, col, 2)] = r.clamp(0.0, 255.0) as u8;
        }
    }
}

fn bilinear_coords(dst: usize, dst_len: usize, src_len: usize) -> (usize, usize, f32) {
    let scale = src_len as f32 / dst_len as f32;
    let center = (dst as f32 + 0.5) * scale - 0.5;
    let lo = center.floor().max(0.0) as usize;
    let hi = (lo + 1).min(src_len - 1);
    let frac = (center - lo as f32).clamp(0.0, 1.0);
    (lo, hi, frac)
}

/// Bilinear resize of an HWC u8 image into `out`'s dimensions.
pub fn resize_bilinear_u8(src: &Array3<u8>, out: &mut Array3<u8>) {
    let (sh, sw, c) = src.dim();
    let (dh, dw, dc) = out.dim();
    debug_assert_eq!(c, dc);

    for row in 0..dh {
        let (r0, r1, rf) = bilinear_coords(row, dh, sh);
        for col in 0..dw {
            let (c0, c1, cf) = bilinear_coords(col, dw, sw);
            for ch in 0..c {
                let tl = src[(r0, c0, ch)] as f32;
                let tr = src[(r0, c1, ch)] as f32;
                let bl = src[(r1, c0, ch)] as f32;
                let br = src[(r1, c1, ch)] as f32;
                let top = tl + (tr - tl) * cf;
                let bottom = bl + (br - bl) * cf;
                out[(row, col, ch)] = (top + (bottom - top) * rf).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Bilinear resize for float images (used once per evaluator on the mean image).
pub fn resize_bilinear_f32(src: &Array3<f32>, out: &mut Array3<f32>) {
    let (sh, sw, c) = src.dim();
    let (dh, dw, dc) = out.dim();
    debug_assert_eq!(c, dc);

    for row in 0..dh {
        let (r0, r1, rf) = bilinear_coords(row, dh, sh);
        for col in 0..dw {
            let (c0, c1, cf) = bilinear_coords(col, dw, sw);
            for ch in 0..c {
                let top = src[(r0, c0, ch)] + (src[(r0, c1, ch)] - src[(r0, c0, ch)]) * cf;
                let bottom = src[(r1, c0, ch)] + (src[(r1, c1, ch)] - src[(r1, c0, ch)]) * cf;
                out[(row, col, ch)] = top + (bottom - top) * rf;
            }
        }
    }
}

/// Widen u8 HWC to f32 HWC.
pub fn to_f32(src: &Array3<u8>, out: &mut Array3<f32>) {
    debug_assert_eq!(src.dim(), out.dim());
    for (dst, src) in out.iter_mut().zip(src.iter()) {
        *dst = *src as f32;
    }
}

/// `out = src - mean`, elementwise.
pub fn subtract_mean(src: &Array3<f32>, mean: &Array3<f32>, out: &mut Array3<f32>) {
    debug_assert_eq!(src.dim(), mean.dim());
    debug_assert_eq!(src.dim(), out.dim());
    for ((dst, a), b) in out.iter_mut().zip(src.iter()).zip(mean.iter()) {
        *dst = a - b;
    }
}

/// Transpose one normalized HWC frame into batch slot `slot` of the NCHW
/// input tensor.
pub fn write_chw(frame: &Array3<f32>, batch: &mut Array4<f32>, slot: usize) {
    let (h, w, c) = frame.dim();
    debug_assert_eq!(batch.dim().1, c);
    debug_assert_eq!(batch.dim().2, h);
    debug_assert_eq!(batch.dim().3, w);

    for ch in 0..c {
        for row in 0..h {
            for col in 0..w {
                batch[(slot, ch, row, col)] = frame[(row, col, ch)];
            }
        }
    }
}
