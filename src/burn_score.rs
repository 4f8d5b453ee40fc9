//! Burn-backed score models (feature `burn`).
//!
//! Wraps a Burn forward function `(x: [B, D], labels: [B]) -> [B, D]` as a [`ScoreModel`].
//! The Jacobian probe is an exact vector-Jacobian product from Burn autodiff instead of the
//! default finite difference, which removes the \(O(h^2)\) bias from likelihood estimates.
//!
//! Conversion happens at the boundary: batches are flattened to `[B, D]` and cast to `f32`.

use burn_core as burn;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use ndarray::{Array1, ArrayD, Axis, IxDyn};

use crate::batch::{self, item_dim};
use crate::score::ScoreModel;

/// Default autodiff backend (CPU, `f32`).
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// A Burn function used as a score network.
pub struct BurnScoreModel<B: AutodiffBackend, F> {
    device: B::Device,
    forward: F,
}

impl<B, F> BurnScoreModel<B, F>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>, Tensor<B, 1>) -> Tensor<B, 2>,
{
    pub fn new(device: B::Device, forward: F) -> Self {
        Self { device, forward }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    fn batch_to_burn(&self, x: &ArrayD<f64>) -> Tensor<B, 2> {
        let n = batch::batch_size(x);
        let d = item_dim(x.shape());
        let data = TensorData::new(x.iter().map(|&v| v as f32).collect::<Vec<f32>>(), [n, d]);
        Tensor::from_data(data, &self.device)
    }

    fn labels_to_burn(&self, labels: &Array1<f64>) -> Tensor<B, 1> {
        let data = TensorData::new(
            labels.iter().map(|&v| v as f32).collect::<Vec<f32>>(),
            [labels.len()],
        );
        Tensor::from_data(data, &self.device)
    }
}

/// Read a `[B, D]` tensor back as `f64` in the given batch shape.
///
/// An unreadable tensor becomes an empty array, which the score adapter reports as a shape
/// mismatch.
fn burn_to_batch<BB: Backend>(t: Tensor<BB, 2>, shape: &[usize]) -> ArrayD<f64> {
    let values = match t.into_data().convert::<f32>().to_vec::<f32>() {
        Ok(v) => v,
        Err(_) => return ArrayD::zeros(IxDyn(&[0])),
    };
    ArrayD::from_shape_vec(IxDyn(shape), values.into_iter().map(f64::from).collect())
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])))
}

impl<B, F> ScoreModel for BurnScoreModel<B, F>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>, Tensor<B, 1>) -> Tensor<B, 2>,
{
    fn forward(&self, x: &ArrayD<f64>, labels: &Array1<f64>) -> ArrayD<f64> {
        let out = (self.forward)(self.batch_to_burn(x), self.labels_to_burn(labels));
        burn_to_batch(out, x.shape())
    }

    /// Exact \(v^\top J v\): backpropagate \(\sum (v \odot \mathrm{forward}(x))\) to `x`.
    fn jacobian_probe(&self, x: &ArrayD<f64>, labels: &Array1<f64>, v: &ArrayD<f64>) -> Array1<f64> {
        let xt = self.batch_to_burn(x).require_grad();
        let out = (self.forward)(xt.clone(), self.labels_to_burn(labels));
        let vt = self.batch_to_burn(v);
        let grads = (out * vt).sum().backward();
        let Some(grad) = xt.grad(&grads) else {
            // The output does not depend on x.
            return Array1::zeros(batch::batch_size(x));
        };
        let vjp = burn_to_batch(grad, x.shape());
        if vjp.shape() != x.shape() {
            return Array1::from_elem(batch::batch_size(x), f64::NAN);
        }
        Array1::from_iter(
            v.axis_iter(Axis(0))
                .zip(vjp.axis_iter(Axis(0)))
                .map(|(vi, gi)| vi.iter().zip(gi.iter()).map(|(a, b)| a * b).sum::<f64>()),
        )
    }
}
