//! Apple Accelerate wrappers.
//!
//! All matrices are row-major `f32`. Every wrapper checks slice lengths and
//! converts dimensions to C ints before touching the framework, so argument
//! errors are reported the same way whether or not Accelerate is linked.

use crate::error::{FfiError, Result};
use std::os::raw::c_int;

/// Whether an operand is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    /// Use the operand as stored.
    No,
    /// Use the transpose of the stored operand.
    Yes,
}

/// Check if Accelerate is linked into this build.
pub fn is_available() -> bool {
    cfg!(all(target_os = "macos", feature = "accelerate"))
}

/// `C = op(A) · op(B)`.
///
/// `op(A)` is `[m, k]`: `A` is stored `[m, k]` for [`Transpose::No`] and
/// `[k, m]` for [`Transpose::Yes`]. Likewise `op(B)` is `[k, n]`. `C` is
/// stored `[m, n]` and fully overwritten.
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
) -> Result<()> {
    check_len("a", a.len(), m, k)?;
    check_len("b", b.len(), k, n)?;
    check_len("c", c.len(), m, n)?;

    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        c[..m * n].fill(0.0);
        return Ok(());
    }

    let (m_c, n_c, k_c) = (to_c_int(m)?, to_c_int(n)?, to_c_int(k)?);
    let lda = match trans_a {
        Transpose::No => k_c,
        Transpose::Yes => m_c,
    };
    let ldb = match trans_b {
        Transpose::No => n_c,
        Transpose::Yes => k_c,
    };
    imp::sgemm(trans_a, trans_b, m_c, n_c, k_c, a, lda, b, ldb, c, n_c)
}

/// `y = op(A) · x` for `A` stored `[rows, cols]`.
///
/// With [`Transpose::No`], `x` has `cols` elements and `y` has `rows`.
/// With [`Transpose::Yes`], `x` has `rows` elements and `y` has `cols`.
pub fn sgemv(
    trans: Transpose,
    rows: usize,
    cols: usize,
    a: &[f32],
    x: &[f32],
    y: &mut [f32],
) -> Result<()> {
    check_len("a", a.len(), rows, cols)?;
    let (x_len, y_len) = match trans {
        Transpose::No => (cols, rows),
        Transpose::Yes => (rows, cols),
    };
    check_len("x", x.len(), x_len, 1)?;
    check_len("y", y.len(), y_len, 1)?;

    if y_len == 0 {
        return Ok(());
    }
    if x_len == 0 {
        y[..y_len].fill(0.0);
        return Ok(());
    }

    imp::sgemv(trans, to_c_int(rows)?, to_c_int(cols)?, a, x, y)
}

/// Numerically stable softmax over `x` in place, scaled by `scale` first.
pub fn softmax_in_place(x: &mut [f32], scale: f32) -> Result<()> {
    if x.is_empty() {
        return Ok(());
    }
    let len = to_c_int(x.len())?;
    let sum = imp::softmax(x, scale, len)?;
    if !sum.is_finite() || sum <= 0.0 {
        return Err(FfiError::BlasError(format!(
            "softmax normalizer is {}",
            sum
        )));
    }
    Ok(())
}

fn check_len(name: &str, len: usize, rows: usize, cols: usize) -> Result<()> {
    let needed = rows.checked_mul(cols).ok_or_else(|| {
        FfiError::InvalidArgument(format!("{}: {} x {} overflows usize", name, rows, cols))
    })?;
    if len < needed {
        return Err(FfiError::InvalidArgument(format!(
            "{}: buffer holds {} elements, {} required",
            name, len, needed
        )));
    }
    Ok(())
}

fn to_c_int(value: usize) -> Result<c_int> {
    c_int::try_from(value)
        .map_err(|_| FfiError::InvalidArgument(format!("dimension {} exceeds C int range", value)))
}

#[cfg(all(target_os = "macos", feature = "accelerate"))]
mod imp {
    use super::Transpose;
    use crate::error::Result;
    use std::os::raw::c_int;

    const CBLAS_ROW_MAJOR: c_int = 101;
    const CBLAS_NO_TRANS: c_int = 111;
    const CBLAS_TRANS: c_int = 112;

    extern "C" {
        fn cblas_sgemm(
            order: c_int,
            trans_a: c_int,
            trans_b: c_int,
            m: c_int,
            n: c_int,
            k: c_int,
            alpha: f32,
            a: *const f32,
            lda: c_int,
            b: *const f32,
            ldb: c_int,
            beta: f32,
            c: *mut f32,
            ldc: c_int,
        );
        fn cblas_sgemv(
            order: c_int,
            trans: c_int,
            m: c_int,
            n: c_int,
            alpha: f32,
            a: *const f32,
            lda: c_int,
            x: *const f32,
            incx: c_int,
            beta: f32,
            y: *mut f32,
            incy: c_int,
        );
        fn vDSP_maxv(a: *const f32, ia: isize, c: *mut f32, n: usize);
        fn vDSP_sve(a: *const f32, ia: isize, c: *mut f32, n: usize);
        fn vDSP_vsadd(a: *const f32, ia: isize, b: *const f32, c: *mut f32, ic: isize, n: usize);
        fn vDSP_vsmul(a: *const f32, ia: isize, b: *const f32, c: *mut f32, ic: isize, n: usize);
        fn vvexpf(y: *mut f32, x: *const f32, n: *const c_int);
    }

    fn cblas_trans(t: Transpose) -> c_int {
        match t {
            Transpose::No => CBLAS_NO_TRANS,
            Transpose::Yes => CBLAS_TRANS,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn sgemm(
        trans_a: Transpose,
        trans_b: Transpose,
        m: c_int,
        n: c_int,
        k: c_int,
        a: &[f32],
        lda: c_int,
        b: &[f32],
        ldb: c_int,
        c: &mut [f32],
        ldc: c_int,
    ) -> Result<()> {
        // SAFETY: lengths were checked against m, n, k by the caller.
        unsafe {
            cblas_sgemm(
                CBLAS_ROW_MAJOR,
                cblas_trans(trans_a),
                cblas_trans(trans_b),
                m,
                n,
                k,
                1.0,
                a.as_ptr(),
                lda,
                b.as_ptr(),
                ldb,
                0.0,
                c.as_mut_ptr(),
                ldc,
            );
        }
        Ok(())
    }

    pub(super) fn sgemv(
        trans: Transpose,
        rows: c_int,
        cols: c_int,
        a: &[f32],
        x: &[f32],
        y: &mut [f32],
    ) -> Result<()> {
        // SAFETY: lengths were checked against rows and cols by the caller.
        unsafe {
            cblas_sgemv(
                CBLAS_ROW_MAJOR,
                cblas_trans(trans),
                rows,
                cols,
                1.0,
                a.as_ptr(),
                cols,
                x.as_ptr(),
                1,
                0.0,
                y.as_mut_ptr(),
                1,
            );
        }
        Ok(())
    }

    pub(super) fn softmax(x: &mut [f32], scale: f32, len: c_int) -> Result<f32> {
        let n = x.len();
        let ptr = x.as_mut_ptr();
        let mut max = 0.0f32;
        let mut sum = 0.0f32;
        // SAFETY: every call reads and writes exactly `n` elements of `x`;
        // vDSP and vForce permit in-place operation.
        unsafe {
            if scale != 1.0 {
                vDSP_vsmul(ptr, 1, &scale, ptr, 1, n);
            }
            vDSP_maxv(ptr, 1, &mut max, n);
            let neg_max = -max;
            vDSP_vsadd(ptr, 1, &neg_max, ptr, 1, n);
            vvexpf(ptr, ptr, &len);
            vDSP_sve(ptr, 1, &mut sum, n);
            if sum.is_finite() && sum > 0.0 {
                let inv = 1.0 / sum;
                vDSP_vsmul(ptr, 1, &inv, ptr, 1, n);
            }
        }
        Ok(sum)
    }
}

#[cfg(not(all(target_os = "macos", feature = "accelerate")))]
mod imp {
    use super::Transpose;
    use crate::error::{FfiError, Result};
    use std::os::raw::c_int;

    fn not_available() -> FfiError {
        FfiError::NotAvailable("Accelerate framework is not linked into this build".to_string())
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn sgemm(
        _trans_a: Transpose,
        _trans_b: Transpose,
        _m: c_int,
        _n: c_int,
        _k: c_int,
        _a: &[f32],
        _lda: c_int,
        _b: &[f32],
        _ldb: c_int,
        _c: &mut [f32],
        _ldc: c_int,
    ) -> Result<()> {
        Err(not_available())
    }

    pub(super) fn sgemv(
        _trans: Transpose,
        _rows: c_int,
        _cols: c_int,
        _a: &[f32],
        _x: &[f32],
        _y: &mut [f32],
    ) -> Result<()> {
        Err(not_available())
    }

    pub(super) fn softmax(_x: &mut [f32], _scale: f32, _len: c_int) -> Result<f32> {
        Err(not_available())
    }
}
