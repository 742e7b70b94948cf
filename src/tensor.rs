//! Shape helpers over `[batch, channels, length]` feature tensors

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};

/// Flatten `[B, C, L]` into `[B * L, C]` so channel mixing becomes a matmul
pub fn to_rows(x: &Array3<f64>) -> Array2<f64> {
    let (b, c, l) = x.dim();
    Array2::from_shape_fn((b * l, c), |(r, ch)| x[[r / l, ch, r % l]])
}

/// Inverse of [`to_rows`]
pub fn from_rows(rows: &Array2<f64>, batch: usize, length: usize) -> Array3<f64> {
    let c = rows.ncols();
    Array3::from_shape_fn((batch, c, length), |(bi, ch, li)| rows[[bi * length + li, ch]])
}

/// `out[.., .., l] = x[.., .., l + offset]`, zero outside the valid range
pub fn shift_length(x: &Array3<f64>, offset: isize) -> Array3<f64> {
    let l = x.dim().2 as isize;
    let mut out = Array3::zeros(x.raw_dim());
    if offset.abs() >= l {
        return out;
    }
    let o = offset.unsigned_abs();
    let len = l as usize;
    if offset >= 0 {
        out.slice_mut(s![.., .., ..len - o]).assign(&x.slice(s![.., .., o..]));
    } else {
        out.slice_mut(s![.., .., o..]).assign(&x.slice(s![.., .., ..len - o]));
    }
    out
}

/// Concatenate along the channel axis
pub fn concat_channels(parts: &[&Array3<f64>]) -> Array3<f64> {
    let (b, _, l) = parts.first().map(|p| p.dim()).unwrap_or((0, 0, 0));
    let total: usize = parts.iter().map(|p| p.dim().1).sum();
    let mut out = Array3::zeros((b, total, l));
    let mut offset = 0;
    for part in parts {
        let c = part.dim().1;
        out.slice_mut(s![.., offset..offset + c, ..]).assign(*part);
        offset += c;
    }
    out
}

/// Split along the channel axis into `n` equal chunks of `channels` each
pub fn split_channels(x: &Array3<f64>, channels: usize, n: usize) -> Vec<Array3<f64>> {
    (0..n)
        .map(|i| x.slice(s![.., i * channels..(i + 1) * channels, ..]).to_owned())
        .collect()
}

/// Numerically stable softmax
pub fn softmax(logits: ArrayView1<f64>) -> Array1<f64> {
    if logits.is_empty() {
        return Array1::zeros(0);
    }
    let max_val = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp: Array1<f64> = logits.mapv(|x| (x - max_val).exp());
    let sum: f64 = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len() as f64)
    }
}

/// Row-wise softmax of a `[n, k]` matrix
pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = Array2::zeros(logits.raw_dim());
    for (i, row) in logits.axis_iter(Axis(0)).enumerate() {
        out.row_mut(i).assign(&softmax(row));
    }
    out
}

/// Pull a gradient w.r.t. softmax outputs back to the logits
pub fn softmax_backward(probs: ArrayView1<f64>, grad_probs: ArrayView1<f64>) -> Array1<f64> {
    let dot = probs.dot(&grad_probs);
    probs.to_owned() * &grad_probs.mapv(|g| g - dot)
}

pub fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

/// Whether every element is finite
pub fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Array3<f64> {
        Array3::from_shape_fn((2, 3, 4), |(b, c, l)| (b * 100 + c * 10 + l) as f64)
    }

    #[test]
    fn test_rows_roundtrip() {
        let x = sample();
        let rows = to_rows(&x);
        assert_eq!(rows.dim(), (8, 3));
        assert_eq!(rows[[5, 2]], x[[1, 2, 1]]);
        assert_eq!(from_rows(&rows, 2, 4), x);
    }

    #[test]
    fn test_shift_length() {
        let x = sample();
        let fwd = shift_length(&x, 1);
        assert_eq!(fwd[[0, 1, 0]], x[[0, 1, 1]]);
        assert_eq!(fwd[[0, 1, 3]], 0.0);
        let back = shift_length(&x, -1);
        assert_eq!(back[[1, 2, 0]], 0.0);
        assert_eq!(back[[1, 2, 3]], x[[1, 2, 2]]);
        assert!(shift_length(&x, 9).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_concat_split() {
        let x = sample();
        let joined = concat_channels(&[&x, &x]);
        assert_eq!(joined.dim(), (2, 6, 4));
        let parts = split_channels(&joined, 3, 2);
        assert_eq!(parts[1], x);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(array![1.0, 2.0, 3.0].view());
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_softmax_backward_matches_finite_difference() {
        let logits = array![0.3, -0.2, 0.9];
        let upstream = array![1.0, -2.0, 0.5];
        let p = softmax(logits.view());
        let grad = softmax_backward(p.view(), upstream.view());
        let eps = 1e-6;
        for i in 0..3 {
            let mut plus = logits.clone();
            plus[i] += eps;
            let mut minus = logits.clone();
            minus[i] -= eps;
            let fd = (softmax(plus.view()).dot(&upstream) - softmax(minus.view()).dot(&upstream)) / (2.0 * eps);
            assert!((fd - grad[i]).abs() < 1e-6);
        }
    }
}
