//! Length masks for padded batches.
//!
//! All masks are built on the host from per-example lengths and moved to the
//! target device once per run.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value of `dtype`, used for scores that must vanish
/// after normalization.
pub fn score_mask_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// `[B, max_len]` mask with 1.0 for `t < lengths[b]` and 0.0 elsewhere.
pub fn sequence_mask(lengths: &[usize], max_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let b = lengths.len();
    let mut data = vec![0f32; b * max_len];
    for (row, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(max_len) {
            data[row * max_len + t] = 1.0;
        }
    }
    Tensor::from_vec(data, (b, max_len), device)?.to_dtype(dtype)
}

/// `[B, max_len]` u32 gather indices that reverse each row within its length
/// and leave the padding in place.
///
/// Applying the permutation twice restores the original order.
pub fn reverse_within_length_indices(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let b = lengths.len();
    let mut data = Vec::with_capacity(b * max_len);
    for &len in lengths {
        let len = len.min(max_len);
        for t in 0..max_len {
            let src = if t < len { len - 1 - t } else { t };
            data.push(src as u32);
        }
    }
    Tensor::from_vec(data, (b, max_len), device)
}

/// Reverse each `[T, C]` row of `xs: [B, T, C]` within its length.
pub fn reverse_sequences(xs: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let (b, t, c) = xs.dims3()?;
    let idx = indices.unsqueeze(2)?.broadcast_as((b, t, c))?.contiguous()?;
    xs.contiguous()?.gather(&idx, 1)
}

/// Zero a `[B, T, D]` tensor beyond each example's length.
pub fn mask_padding(xs: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let t = xs.dim(1)?;
    let mask = sequence_mask(lengths, t, xs.dtype(), xs.device())?.unsqueeze(2)?;
    xs.broadcast_mul(&mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mask() {
        let mask = sequence_mask(&[3, 1, 0], 4, DType::F32, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![1.0, 1.0, 1.0, 0.0],
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 0.0, 0.0, 0.0]
            ]
        );
    }

    #[test]
    fn test_reverse_within_length() {
        let dev = Device::Cpu;
        let xs = Tensor::arange(0f32, 8.0, &dev)
            .unwrap()
            .reshape((2, 4, 1))
            .unwrap();
        let idx = reverse_within_length_indices(&[4, 2], 4, &dev).unwrap();
        let rev = reverse_sequences(&xs, &idx).unwrap();
        let rows: Vec<Vec<f32>> = rev.squeeze(2).unwrap().to_vec2().unwrap();
        assert_eq!(rows, vec![vec![3.0, 2.0, 1.0, 0.0], vec![5.0, 4.0, 6.0, 7.0]]);

        let back = reverse_sequences(&rev, &idx).unwrap();
        let diff: f32 = (back - &xs).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_mask_padding() {
        let xs = Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let masked = mask_padding(&xs, &[3, 1]).unwrap();
        let total: f32 = masked.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, 8.0);
    }

    #[test]
    fn test_score_mask_value_is_finite() {
        assert!(score_mask_value(DType::F32).is_finite());
        assert!(score_mask_value(DType::F32) < -1e30);
    }
}
