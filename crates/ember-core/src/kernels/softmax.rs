//! Row-wise softmax.

use super::{scalar, Primitives};
use crate::pool;
use tracing::debug;

/// Rows at or above which softmax splits across the worker pool.
pub const PARALLEL_MIN_ROWS: usize = 4;

/// Softmax of every `cols`-sized row of `x` after multiplying by `scale`.
pub(crate) fn softmax_rows(prims: &Primitives, threads: usize, x: &mut [f32], cols: usize, scale: f32) {
    if cols == 0 || x.len() % cols != 0 {
        debug!(len = x.len(), cols, "softmax: row size does not divide input");
        return;
    }
    let rows = x.len() / cols;
    if threads > 1 && rows >= PARALLEL_MIN_ROWS {
        let body = |_: usize, row: &mut [f32]| softmax_row(prims, row, scale);
        pool::global().for_each_row(x, cols, 1, threads, &body);
    } else {
        for row in x.chunks_exact_mut(cols) {
            softmax_row(prims, row, scale);
        }
    }
}

/// Stable softmax of one row. A row with no finite maximum becomes uniform.
pub(crate) fn softmax_row(prims: &Primitives, row: &mut [f32], scale: f32) {
    if row.is_empty() {
        return;
    }
    if scale != 1.0 {
        (prims.scale)(row, scale);
    }
    let max = (prims.max)(row);
    if !max.is_finite() {
        row.fill(1.0 / row.len() as f32);
        return;
    }
    let sum = (prims.exp_sum)(row, max);
    (prims.scale)(row, 1.0 / sum);
}

/// Row softmax through a vendor routine that reports failure with `false`.
/// A rejected row is restored from its input and redone on `prims`.
#[cfg(any(test, all(target_os = "macos", feature = "accelerate")))]
pub(crate) fn softmax_rows_via(
    prims: &Primitives,
    x: &mut [f32],
    cols: usize,
    scale: f32,
    vendor: impl Fn(&mut [f32], f32) -> bool,
) {
    if cols == 0 || x.len() % cols != 0 {
        debug!(len = x.len(), cols, "softmax: row size does not divide input");
        return;
    }
    let mut saved = Vec::new();
    if saved.try_reserve_exact(cols).is_err() {
        debug!(cols, "softmax: no room to stage a row, using vector kernels");
        for row in x.chunks_exact_mut(cols) {
            softmax_row(prims, row, scale);
        }
        return;
    }
    for row in x.chunks_exact_mut(cols) {
        // vendor routines have no answer for a row without a finite maximum
        if !(prims.max)(row).is_finite() {
            softmax_row(prims, row, scale);
            continue;
        }
        saved.clear();
        saved.extend_from_slice(row);
        if !vendor(row, scale) {
            debug!(cols, "softmax: vendor routine failed, redoing row");
            row.copy_from_slice(&saved);
            softmax_row(prims, row, scale);
        }
    }
}

/// Single-row softmax on the portable path.
pub fn softmax(row: &mut [f32], scale: f32) {
    softmax_row(&scalar::PRIMITIVES, row, scale);
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::backend::BackendSettings;
    use crate::capability;
    use crate::kernels::builtin_backends;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn rows_sum_to_one(row in prop::collection::vec(-50.0f32..50.0, 1..200)) {
            let mut x = row;
            softmax(&mut x, 1.0);
            let sum: f32 = x.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-4);
        }

        #[test]
        fn every_backend_rows_sum_to_one(
            (cols, data) in (1usize..80, 1usize..10).prop_flat_map(|(cols, rows)| {
                (Just(cols), prop::collection::vec(-50.0f32..50.0, cols * rows))
            }),
            threads in 1usize..5,
            scale in 0.1f32..3.0,
        ) {
            let settings = BackendSettings { threads };
            for entry in builtin_backends() {
                if !capability::detect().is_available(entry.capability) {
                    continue;
                }
                let ops = (entry.factory)(&settings);
                let mut x = data.clone();
                let _ = ops.softmax(&mut x, cols, scale);
                for row in x.chunks_exact(cols) {
                    let sum: f32 = row.iter().sum();
                    prop_assert!((sum - 1.0).abs() < 1e-4, "{} threads {}: sum {}", entry.name, threads, sum);
                    prop_assert!(row.iter().all(|&v| v >= 0.0 && v <= 1.0 + 1e-6));
                }
            }
        }

        #[test]
        fn scale_matches_prescaled_input(
            row in prop::collection::vec(-10.0f32..10.0, 1..100),
            c in 0.05f32..4.0,
        ) {
            let settings = BackendSettings { threads: 1 };
            for entry in builtin_backends() {
                if !capability::detect().is_available(entry.capability) {
                    continue;
                }
                let ops = (entry.factory)(&settings);
                let mut scaled = row.clone();
                let _ = ops.softmax(&mut scaled, row.len(), c);
                let mut pre: Vec<f32> = row.iter().map(|v| v * c).collect();
                let _ = ops.softmax(&mut pre, row.len(), 1.0);
                for (a, b) in scaled.iter().zip(&pre) {
                    prop_assert!((a - b).abs() < 1e-5, "{}: {} vs {}", entry.name, a, b);
                }
            }
        }
    }
}
