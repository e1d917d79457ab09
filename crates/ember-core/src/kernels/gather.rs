//! Embedding lookup and KV cache append.

use super::is_dense_float;
use crate::tensor::{TensorMeta, TensorView, TensorViewMut};
use tracing::debug;

/// Copy rows `ids` of `table` (`[vocab, hidden]`) into `out` as f32.
/// Nothing is written if any id is out of range.
pub(crate) fn embedding(table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) {
    if !is_dense_float(table, 2) {
        debug!(dims = ?table.dims(), "embedding: table must be a contiguous 2D float tensor");
        return;
    }
    let (vocab, hidden) = (table.dims()[0], table.dims()[1]);
    if out.len() != ids.len() * hidden {
        debug!(out = out.len(), ids = ids.len(), hidden, "embedding: output size mismatch");
        return;
    }
    if let Some(&id) = ids.iter().find(|&&id| id as usize >= vocab) {
        debug!(id, vocab, "embedding: token id out of range");
        return;
    }
    for (&id, row) in ids.iter().zip(out.chunks_exact_mut(hidden)) {
        table.read_f32(id as usize * hidden, row);
    }
}

/// Write `k`/`v` (whole `[kv_heads, head_dim]` rows) into the caches at
/// `live_len`. Returns the new live length, or `live_len` unchanged when
/// the rows do not fit.
pub(crate) fn kv_append(
    keys: &mut TensorViewMut<'_>,
    values: &mut TensorViewMut<'_>,
    k: &[f32],
    v: &[f32],
    live_len: usize,
) -> usize {
    if !is_dense_float(&*keys, 3) || !keys.same_shape(&*values) || !is_dense_float(&*values, 3) {
        debug!(keys = ?keys.dims(), values = ?values.dims(), "kv_append: caches must be matching contiguous [capacity, kv_heads, head_dim] tensors");
        return live_len;
    }
    let capacity = keys.dims()[0];
    let row = keys.dims()[1] * keys.dims()[2];
    if k.len() != v.len() || k.len() % row != 0 {
        debug!(k = k.len(), v = v.len(), row, "kv_append: rows do not match the cache geometry");
        return live_len;
    }
    let new_tokens = k.len() / row;
    if live_len + new_tokens > capacity {
        debug!(live_len, new_tokens, capacity, "kv_append: cache full");
        return live_len;
    }
    keys.write_f32(live_len * row, k);
    values.write_f32(live_len * row, v);
    live_len + new_tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Tensor};

    #[test]
    fn embedding_converts_rows() {
        let table = Tensor::from_f32_as(DType::F16, &[3, 2], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let mut out = vec![0.0; 4];
        embedding(&table.view(), &[2, 0], &mut out);
        assert_eq!(out, vec![4.0, 5.0, 0.0, 1.0]);
    }

    #[test]
    fn embedding_rejects_bad_ids_without_writing() {
        let table = Tensor::from_f32(&[2, 2], vec![1.0; 4]).unwrap();
        let mut out = vec![-1.0; 4];
        embedding(&table.view(), &[0, 2], &mut out);
        assert_eq!(out, vec![-1.0; 4]);
    }

    #[test]
    fn append_writes_at_live_len() {
        let mut keys = Tensor::zeros(DType::F32, &[4, 1, 2]).unwrap();
        let mut values = Tensor::zeros(DType::BF16, &[4, 1, 2]).unwrap();
        let len = kv_append(&mut keys.view_mut(), &mut values.view_mut(), &[1.0, 2.0], &[3.0, 4.0], 0);
        assert_eq!(len, 1);
        let len = kv_append(
            &mut keys.view_mut(),
            &mut values.view_mut(),
            &[5.0, 6.0, 7.0, 8.0],
            &[9.0, 10.0, 11.0, 12.0],
            len,
        );
        assert_eq!(len, 3);
        assert_eq!(keys.as_f32().unwrap(), &[1.0, 2.0, 5.0, 6.0, 7.0, 8.0, 0.0, 0.0]);
        assert_eq!(values.to_f32_vec()[..6], [3.0, 4.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn append_past_capacity_is_rejected() {
        let mut keys = Tensor::zeros(DType::F32, &[1, 1, 2]).unwrap();
        let mut values = Tensor::zeros(DType::F32, &[1, 1, 2]).unwrap();
        let len = kv_append(&mut keys.view_mut(), &mut values.view_mut(), &[1.0; 4], &[1.0; 4], 0);
        assert_eq!(len, 0);
        assert_eq!(keys.as_f32().unwrap(), &[0.0, 0.0]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::tensor::{DType, Tensor};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn appends_are_monotonic_and_disjoint(chunks in prop::collection::vec(1usize..5, 1..10)) {
            let capacity: usize = chunks.iter().sum();
            let row = 3;
            let mut keys = Tensor::zeros(DType::F32, &[capacity, 1, row]).unwrap();
            let mut values = Tensor::zeros(DType::F32, &[capacity, 1, row]).unwrap();
            let mut len = 0;
            for (i, &n) in chunks.iter().enumerate() {
                let tag = (i + 1) as f32;
                let data = vec![tag; n * row];
                let next = kv_append(&mut keys.view_mut(), &mut values.view_mut(), &data, &data, len);
                prop_assert_eq!(next, len + n);
                len = next;
            }
            prop_assert_eq!(len, capacity);
            // every element carries the tag of exactly the append that wrote it
            let stored = keys.as_f32().unwrap();
            let mut start = 0;
            for (i, &n) in chunks.iter().enumerate() {
                let tag = (i + 1) as f32;
                prop_assert!(stored[start * row..(start + n) * row].iter().all(|&v| v == tag));
                start += n;
            }
        }
    }
}
