//! Batch helpers.
//!
//! States are `ArrayD<f64>` with the batch on axis 0. SDE coefficients that depend only on
//! time (diffusion, marginal std, step sizes) are per-item scalars (`Array1<f64>` of length
//! `B`) and are broadcast over the item axes here, so the rest of the crate never has to
//! reason about the item rank.

use crate::{Error, Result};
use ndarray::{Array1, ArrayD, ArrayView1, Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Batch size (length of axis 0).
#[inline]
pub fn batch_size(x: &ArrayD<f64>) -> usize {
    x.shape().first().copied().unwrap_or(0)
}

/// Number of scalars per batch item (product of the non-batch dims).
#[inline]
pub fn item_dim(shape: &[usize]) -> usize {
    shape.iter().skip(1).product()
}

/// A per-item time vector filled with `t`.
#[inline]
pub fn full_t(batch: usize, t: f64) -> Array1<f64> {
    Array1::from_elem(batch, t)
}

/// Multiply batch item `b` by `s[b]`.
pub fn scale_items(x: &ArrayD<f64>, s: &Array1<f64>) -> ArrayD<f64> {
    debug_assert_eq!(batch_size(x), s.len());
    let mut out = x.to_owned();
    for (mut item, &c) in out.axis_iter_mut(Axis(0)).zip(s.iter()) {
        item.mapv_inplace(|v| v * c);
    }
    out
}

/// Euclidean norm of every batch item, flattened over the non-batch dims.
pub fn item_norms(x: &ArrayD<f64>) -> Array1<f64> {
    Array1::from_iter(
        x.axis_iter(Axis(0))
            .map(|item| item.iter().map(|v| v * v).sum::<f64>().sqrt()),
    )
}

/// Per-item inner product `<a_b, b_b>`.
pub fn item_dot(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Array1<f64> {
    debug_assert_eq!(a.shape(), b.shape());
    Array1::from_iter(
        a.axis_iter(Axis(0))
            .zip(b.axis_iter(Axis(0)))
            .map(|(ai, bi)| ai.iter().zip(bi.iter()).map(|(x, y)| x * y).sum::<f64>()),
    )
}

/// Per-item sum of squares.
pub fn item_sum_sq(x: &ArrayD<f64>) -> Array1<f64> {
    Array1::from_iter(
        x.axis_iter(Axis(0))
            .map(|item| item.iter().map(|v| v * v).sum::<f64>()),
    )
}

/// Standard Gaussian draw of the given shape.
pub fn randn<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        let v: f64 = StandardNormal.sample(&mut *rng);
        v
    })
}

/// Rademacher draw (entries ±1 with equal probability) of the given shape.
pub fn rademacher<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<f64> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        if rng.random::<bool>() {
            1.0
        } else {
            -1.0
        }
    })
}

/// Flatten a batch into the solver's state vector (logical, row-major order).
pub fn flatten(x: &ArrayD<f64>) -> Array1<f64> {
    Array1::from_iter(x.iter().copied())
}

/// Inverse of [`flatten`].
pub fn unflatten(v: &ArrayView1<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    let expected: usize = shape.iter().product();
    if v.len() != expected {
        return Err(Error::ShapeMismatch {
            what: "flat state",
            expected: vec![expected],
            got: vec![v.len()],
        });
    }
    ArrayD::from_shape_vec(IxDyn(shape), v.iter().copied().collect()).map_err(|_| {
        Error::ShapeMismatch {
            what: "flat state",
            expected: shape.to_vec(),
            got: vec![v.len()],
        }
    })
}

/// Fail with [`Error::ShapeMismatch`] unless `got == expected`.
pub fn check_shape(what: &'static str, expected: &[usize], got: &[usize]) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        });
    }
    Ok(())
}

/// Validate a sampling shape: at least a batch axis, and no empty dims.
pub fn validate_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() {
        return Err(Error::Configuration("shape must include a batch axis"));
    }
    if shape.iter().any(|&d| d == 0) {
        return Err(Error::Configuration("shape dims must be >= 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn scale_items_scales_each_item_independently() {
        let x = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let s = array![2.0, -1.0];
        let y = scale_items(&x, &s);
        assert_eq!(y, array![[2.0, 4.0], [-3.0, -4.0]].into_dyn());
    }

    #[test]
    fn item_norms_flatten_non_batch_dims() {
        let x = ArrayD::from_shape_vec(IxDyn(&[2, 2, 2]), vec![1.0; 8]).unwrap();
        let n = item_norms(&x);
        assert!((n[0] - 2.0).abs() < 1e-12);
        assert!((n[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rademacher_entries_are_plus_minus_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let v = rademacher(&[4, 3, 5], &mut rng);
        assert!(v.iter().all(|&x| x == 1.0 || x == -1.0));
        assert!(v.iter().any(|&x| x == 1.0));
        assert!(v.iter().any(|&x| x == -1.0));
    }

    #[test]
    fn unflatten_rejects_wrong_length() {
        let v = Array1::<f64>::zeros(5);
        assert!(unflatten(&v.view(), &[2, 3]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_flatten_unflatten_preserves_layout(
            b in 1usize..5,
            c in 1usize..4,
            d in 1usize..6,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let x = randn(&[b, c, d], &mut rng);
            let flat = flatten(&x);
            prop_assert_eq!(flat.len(), b * c * d);
            let back = unflatten(&flat.view(), &[b, c, d]).unwrap();
            prop_assert_eq!(back, x);
        }
    }
}
