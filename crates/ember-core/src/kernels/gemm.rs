//! Matrix multiply driver shared by the SIMD backends.
//!
//! `C = op(A) · op(B)` with f32 accumulation for any float operand types.
//! `B` (the weight in every model call) is consumed in tiles converted to f32
//! that fit half the L2 cache. Two inner forms exist, picked from how `B`
//! sits in memory:
//! - dot form, `B` stored `[n, k]`: `c[i][j] = dot(a_i, b_j)`
//! - axpy form, `B` stored `[k, n]`: `c_i += a[i][p] * b_p`
//!
//! Large problems split the rows of `C` across the worker pool. A row's
//! arithmetic does not depend on how many rows are computed with it, so a
//! one-row call and a many-row call give bit-identical rows.
//!
//! When a scratch buffer cannot be allocated the driver falls back to
//! [`gemm_reference`], which allocates nothing.

use super::Primitives;
use crate::pool;
use crate::tensor::{DType, TensorMeta, TensorView, TensorViewMut};
use std::borrow::Cow;
use tracing::{debug, warn};

pub use ember_ffi::Transpose;

/// Rows of `C` below which GEMM stays on the calling thread.
pub const PARALLEL_MIN_ROWS: usize = 64;
/// Estimated flops (`2·M·N·K`) below which GEMM stays on the calling thread.
pub const PARALLEL_MIN_FLOPS: usize = 1 << 22;

/// Smallest conversion tile, in bytes.
const MIN_TILE_BYTES: usize = 16 * 1024;

/// Validated problem size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GemmDims {
    pub(crate) m: usize,
    pub(crate) n: usize,
    pub(crate) k: usize,
}

impl GemmDims {
    pub(crate) fn flops(&self) -> usize {
        2usize
            .saturating_mul(self.m)
            .saturating_mul(self.n)
            .saturating_mul(self.k)
    }

    /// Whether a call with `threads` available should split rows.
    pub(crate) fn parallel(&self, threads: usize) -> bool {
        threads > 1 && self.m >= PARALLEL_MIN_ROWS && self.flops() >= PARALLEL_MIN_FLOPS
    }
}

fn op_dims(t: &impl TensorMeta, trans: Transpose) -> (usize, usize) {
    let d = t.dims();
    match trans {
        Transpose::No => (d[0], d[1]),
        Transpose::Yes => (d[1], d[0]),
    }
}

/// Check operand ranks, types and extents. `None` (logged) if they do not
/// fit together.
pub(crate) fn gemm_dims(
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    c: &TensorViewMut<'_>,
    trans_a: Transpose,
    trans_b: Transpose,
) -> Option<GemmDims> {
    if a.ndim() != 2 || b.ndim() != 2 || c.ndim() != 2 {
        debug!(a = ?a.dims(), b = ?b.dims(), c = ?c.dims(), "gemm: operands must be 2D");
        return None;
    }
    for dtype in [a.dtype(), b.dtype(), c.dtype()] {
        if !dtype.is_executable() {
            debug!(%dtype, "gemm: non-float operand");
            return None;
        }
    }
    let (m, k) = op_dims(a, trans_a);
    let (kb, n) = op_dims(b, trans_b);
    if k != kb || c.dims() != [m, n].as_slice() {
        debug!(a = ?a.dims(), b = ?b.dims(), c = ?c.dims(), "gemm: extents do not match");
        return None;
    }
    Some(GemmDims { m, n, k })
}

/// A 2D operand whose storage is row-major in one of its two orientations.
pub(crate) struct Rows<'v> {
    pub(crate) view: TensorView<'v>,
    pub(crate) rows: usize,
    pub(crate) cols: usize,
}

impl<'v> Rows<'v> {
    /// Storage rows of `t`, and whether they run along `t`'s columns.
    /// `None` for layouts contiguous in neither orientation.
    pub(crate) fn of(t: &TensorView<'v>) -> Option<(Self, bool)> {
        if t.is_contiguous() {
            let (rows, cols) = (t.dims()[0], t.dims()[1]);
            return Some((Self { view: t.clone(), rows, cols }, false));
        }
        let flipped = t.transpose(0, 1).ok()?;
        if flipped.is_contiguous() {
            let (rows, cols) = (flipped.dims()[0], flipped.dims()[1]);
            return Some((
                Self {
                    view: flipped,
                    rows,
                    cols,
                },
                true,
            ));
        }
        None
    }

    pub(crate) fn is_f32(&self) -> bool {
        self.view.dtype() == DType::F32
    }

    /// Storage rows `start..start + len` as f32, borrowed when already f32.
    pub(crate) fn f32_rows<'s>(&'s self, start: usize, len: usize, scratch: &'s mut Vec<f32>) -> &'s [f32] {
        let range = start * self.cols..(start + len) * self.cols;
        if let Some(s) = self.view.as_f32() {
            return &s[range];
        }
        scratch.clear();
        scratch.resize(range.len(), 0.0);
        self.view.read_f32(range.start, scratch);
        &scratch[..]
    }
}

/// Whether the inner loop is the dot form for `B` stored as `rows` with
/// the given orientation.
pub(crate) fn is_dot_form(flipped: bool, trans_b: Transpose) -> bool {
    flipped != (trans_b == Transpose::Yes)
}

/// Rows of `op(A)` as a contiguous f32 `[m, k]` buffer.
pub(crate) fn op_a_f32<'v>(a: &TensorView<'v>, trans_a: Transpose, dims: GemmDims) -> Option<Cow<'v, [f32]>> {
    let len = dims.m * dims.k;
    if trans_a == Transpose::No && a.is_contiguous() {
        if let Some(s) = a.as_f32() {
            return Some(Cow::Borrowed(&s[..len]));
        }
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0.0);
    if trans_a == Transpose::No && a.is_contiguous() {
        a.read_f32(0, &mut buf);
        return Some(Cow::Owned(buf));
    }
    let (s0, s1) = (a.strides()[0], a.strides()[1]);
    for i in 0..dims.m {
        for p in 0..dims.k {
            let offset = match trans_a {
                Transpose::No => i * s0 + p * s1,
                Transpose::Yes => p * s0 + i * s1,
            };
            buf[i * dims.k + p] = a.get_f32(offset);
        }
    }
    Some(Cow::Owned(buf))
}

/// Storage rows per conversion tile for rows of `cols` elements.
pub(crate) fn tile_rows(tile_bytes: usize, cols: usize, total: usize) -> usize {
    let bytes = tile_bytes.max(MIN_TILE_BYTES);
    (bytes / (4 * cols.max(1))).clamp(1, total)
}

/// Tiled GEMM through `prims`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gemm_tiled(
    prims: &Primitives,
    threads: usize,
    tile_bytes: usize,
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    c: &mut TensorViewMut<'_>,
    trans_a: Transpose,
    trans_b: Transpose,
) {
    let Some(dims) = gemm_dims(a, b, c, trans_a, trans_b) else {
        return;
    };
    let Some((b_rows, flipped)) = Rows::of(b) else {
        debug!(b = ?b.dims(), "gemm: B is not contiguous in either orientation, using reference loop");
        gemm_reference(a, b, c, trans_a, trans_b);
        return;
    };
    let Some(a_rows) = op_a_f32(a, trans_a, dims) else {
        warn!(m = dims.m, k = dims.k, "gemm: could not allocate A scratch, using reference loop");
        gemm_reference(a, b, c, trans_a, trans_b);
        return;
    };
    let dot_form = is_dot_form(flipped, trans_b);
    let parts = if dims.parallel(threads) { threads } else { 1 };

    if c.is_contiguous() {
        if let Some(out) = c.as_f32_mut() {
            if !run_tiled(prims, parts, tile_bytes, &a_rows, &b_rows, dot_form, out, dims) {
                warn!("gemm: could not allocate B tile, using reference loop");
                gemm_reference(a, b, c, trans_a, trans_b);
            }
            return;
        }
    }

    let mut out = Vec::new();
    let ok = out.try_reserve_exact(dims.m * dims.n).is_ok() && {
        out.resize(dims.m * dims.n, 0.0);
        run_tiled(prims, parts, tile_bytes, &a_rows, &b_rows, dot_form, &mut out, dims)
    };
    if !ok {
        warn!("gemm: could not allocate output scratch, using reference loop");
        gemm_reference(a, b, c, trans_a, trans_b);
        return;
    }
    match TensorView::wrap_f32(&[dims.m, dims.n], &out) {
        Ok(src) => {
            if let Err(e) = c.copy_from(&src) {
                debug!(error = %e, "gemm: output conversion failed");
            }
        }
        Err(e) => debug!(error = %e, "gemm: output conversion failed"),
    }
}

/// Inner tiled loop into contiguous f32 `c`. Returns false, with `c`
/// untouched, if the tile buffer cannot be allocated.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_tiled(
    prims: &Primitives,
    parts: usize,
    tile_bytes: usize,
    a: &[f32],
    b: &Rows<'_>,
    dot_form: bool,
    c: &mut [f32],
    dims: GemmDims,
) -> bool {
    let GemmDims { m, n, k } = dims;
    let tile = tile_rows(tile_bytes, b.cols, b.rows);
    let mut scratch = Vec::new();
    if !b.is_f32() && scratch.try_reserve_exact(tile * b.cols).is_err() {
        return false;
    }
    let c = &mut c[..m * n];

    let run_rows = |c: &mut [f32], body: &(dyn Fn(usize, &mut [f32]) + Sync)| {
        if parts > 1 {
            pool::global().for_each_row(c, n, 1, parts, body);
        } else {
            for (i, row) in c.chunks_exact_mut(n).enumerate() {
                body(i, row);
            }
        }
    };

    if dot_form {
        // B stored [n, k]: each storage row is one output column.
        for j0 in (0..n).step_by(tile) {
            let width = tile.min(n - j0);
            let bt = b.f32_rows(j0, width, &mut scratch);
            let body = |i: usize, c_row: &mut [f32]| {
                let a_row = &a[i * k..(i + 1) * k];
                for (jj, b_row) in bt.chunks_exact(k).enumerate() {
                    c_row[j0 + jj] = (prims.dot)(a_row, b_row);
                }
            };
            run_rows(&mut *c, &body);
        }
    } else {
        // B stored [k, n]: accumulate scaled rows of B into each C row.
        c.fill(0.0);
        for p0 in (0..k).step_by(tile) {
            let depth = tile.min(k - p0);
            let bt = b.f32_rows(p0, depth, &mut scratch);
            let body = |i: usize, c_row: &mut [f32]| {
                let a_seg = &a[i * k + p0..i * k + p0 + depth];
                for (&a_ip, b_row) in a_seg.iter().zip(bt.chunks_exact(n)) {
                    (prims.axpy)(c_row, a_ip, b_row);
                }
            };
            run_rows(&mut *c, &body);
        }
    }
    true
}

/// `y = op(A) · x` through the tiled loop, `A` stored `[rows, cols]`.
pub(crate) fn gemv_tiled(
    prims: &Primitives,
    tile_bytes: usize,
    a: &TensorView<'_>,
    x: &[f32],
    y: &mut [f32],
    trans: Transpose,
) {
    let Some((n, k)) = gemv_dims(a, x, y, trans) else {
        return;
    };
    // y^T = x^T · op(A)^T, so A plays B with the opposite transpose.
    let trans_b = match trans {
        Transpose::No => Transpose::Yes,
        Transpose::Yes => Transpose::No,
    };
    let Some((rows, flipped)) = Rows::of(a) else {
        gemv_reference(a, x, y, trans);
        return;
    };
    let dims = GemmDims { m: 1, n, k };
    if !run_tiled(prims, 1, tile_bytes, x, &rows, is_dot_form(flipped, trans_b), y, dims) {
        warn!("gemv: could not allocate tile, using reference loop");
        gemv_reference(a, x, y, trans);
    }
}

/// `(outputs, inputs)` of a GEMV, or `None` (logged) on a contract
/// violation.
pub(crate) fn gemv_dims(a: &TensorView<'_>, x: &[f32], y: &[f32], trans: Transpose) -> Option<(usize, usize)> {
    if a.ndim() != 2 || !a.dtype().is_executable() {
        debug!(a = ?a.dims(), dtype = %a.dtype(), "gemv: A must be a 2D float matrix");
        return None;
    }
    let (outputs, inputs) = op_dims(a, trans);
    if x.len() != inputs || y.len() != outputs {
        debug!(a = ?a.dims(), x = x.len(), y = y.len(), "gemv: extents do not match");
        return None;
    }
    Some((outputs, inputs))
}

/// Naive triple loop over arbitrary strides. Allocates nothing; the
/// correctness oracle for every backend.
pub fn gemm_reference(
    a: &TensorView<'_>,
    b: &TensorView<'_>,
    c: &mut TensorViewMut<'_>,
    trans_a: Transpose,
    trans_b: Transpose,
) {
    let Some(GemmDims { m, n, k }) = gemm_dims(a, b, c, trans_a, trans_b) else {
        return;
    };
    let (as0, as1) = op_strides(a, trans_a);
    let (bs0, bs1) = op_strides(b, trans_b);
    let (cs0, cs1) = (c.strides()[0], c.strides()[1]);
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a.get_f32(i * as0 + p * as1) * b.get_f32(p * bs0 + j * bs1);
            }
            c.set_f32(i * cs0 + j * cs1, acc);
        }
    }
}

/// Naive `y = op(A) · x`.
pub fn gemv_reference(a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) {
    if gemv_dims(a, x, y, trans).is_none() {
        return;
    }
    let (s0, s1) = op_strides(a, trans);
    for (r, out) in y.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for (c, &xv) in x.iter().enumerate() {
            acc += a.get_f32(r * s0 + c * s1) * xv;
        }
        *out = acc;
    }
}

fn op_strides(t: &impl TensorMeta, trans: Transpose) -> (usize, usize) {
    let s = t.strides();
    match trans {
        Transpose::No => (s[0], s[1]),
        Transpose::Yes => (s[1], s[0]),
    }
}
