//! Score models and the per-SDE score adapter.
//!
//! A [`ScoreModel`] is the raw network: `forward(x, labels)` with whatever label convention it
//! was trained with. A [`ScoreFn`] is the thing samplers consume: \(s(x, t) \approx \nabla_x
//! \log p_t(x)\) in continuous time. [`ModelScore`] turns the former into the latter for a
//! given SDE (label mapping plus output rescaling).
//!
//! Both traits also expose a Jacobian probe \(v^\top J v\), which is all the likelihood engine
//! needs for a Hutchinson trace estimate. The default is a central finite difference; backends
//! with autodiff can override it with an exact vector-Jacobian product.

use crate::batch::{self, item_dot};
use crate::sde::{time_index, DiscreteSchedule, Sde, SdeKind};
use crate::Result;
use ndarray::{Array1, ArrayD, IxDyn};

/// Step used by the default finite-difference Jacobian probes.
pub const FD_STEP: f64 = 1e-4;

/// Central-difference estimate of \(v^\top J_f(x) v\) per batch item.
///
/// Exact for `f` affine in `x`; otherwise the error is \(O(h^2)\).
pub fn finite_difference_probe<F>(f: F, x: &ArrayD<f64>, v: &ArrayD<f64>, h: f64) -> Array1<f64>
where
    F: Fn(&ArrayD<f64>) -> ArrayD<f64>,
{
    let hv = v * h;
    let plus = f(&(x + &hv));
    let minus = f(&(x - &hv));
    let jv = (plus - minus) / (2.0 * h);
    item_dot(v, &jv)
}

/// A trained score network (opaque to this crate).
pub trait ScoreModel {
    /// Network output for a batch `x` of shape `[B, ...]` and per-item `labels` of length `B`.
    fn forward(&self, x: &ArrayD<f64>, labels: &Array1<f64>) -> ArrayD<f64>;

    /// \(v^\top (\partial\,\mathrm{forward}/\partial x)\, v\) per batch item.
    fn jacobian_probe(&self, x: &ArrayD<f64>, labels: &Array1<f64>, v: &ArrayD<f64>) -> Array1<f64> {
        finite_difference_probe(|y| self.forward(y, labels), x, v, FD_STEP)
    }
}

impl<F> ScoreModel for F
where
    F: Fn(&ArrayD<f64>, &Array1<f64>) -> ArrayD<f64>,
{
    fn forward(&self, x: &ArrayD<f64>, labels: &Array1<f64>) -> ArrayD<f64> {
        self(x, labels)
    }
}

/// A continuous-time score function \(s(x, t)\).
pub trait ScoreFn {
    fn score(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> Result<ArrayD<f64>>;

    /// \(v^\top (\partial s/\partial x)\, v\) per batch item.
    fn score_jacobian_probe(
        &self,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
        v: &ArrayD<f64>,
    ) -> Result<Array1<f64>> {
        let hv = v * FD_STEP;
        let plus = self.score(&(x + &hv), t)?;
        let minus = self.score(&(x - &hv), t)?;
        let jv = (plus - minus) / (2.0 * FD_STEP);
        Ok(item_dot(v, &jv))
    }
}

impl<F> ScoreFn for F
where
    F: Fn(&ArrayD<f64>, &Array1<f64>) -> ArrayD<f64>,
{
    fn score(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> Result<ArrayD<f64>> {
        Ok(self(x, t))
    }
}

/// Evaluate `score` and check that it returned one value per state entry.
pub fn evaluate<F>(score: &F, x: &ArrayD<f64>, t: &Array1<f64>) -> Result<ArrayD<f64>>
where
    F: ScoreFn + ?Sized,
{
    let s = score.score(x, t)?;
    batch::check_shape("score output", x.shape(), s.shape())?;
    Ok(s)
}

/// Wraps a [`ScoreModel`] as a [`ScoreFn`] for a particular SDE.
///
/// Label conventions:
///
/// | SDE | continuous | labels | score |
/// |---|---|---|---|
/// | VP / sub-VP | yes (sub-VP always) | `999 t` | `-model / std(t)` |
/// | VP | no | `t (N-1)` | `-model / sqrt(1 - ᾱ[idx])` |
/// | VE | yes | `σ(t)` | `model` |
/// | VE | no | `round((T - t)(N-1))` | `model` |
/// | other | either | `t` | `model` |
pub struct ModelScore<'a, S: ?Sized, M: ?Sized> {
    sde: &'a S,
    model: &'a M,
    continuous: bool,
}

impl<'a, S, M> ModelScore<'a, S, M>
where
    S: Sde + ?Sized,
    M: ScoreModel + ?Sized,
{
    pub fn new(sde: &'a S, model: &'a M, continuous: bool) -> Self {
        Self {
            sde,
            model,
            continuous,
        }
    }

    /// Marginal std at `t`; it does not depend on `x`, so a `[B, 1]` placeholder is enough.
    fn marginal_std(&self, t: &Array1<f64>) -> Array1<f64> {
        let placeholder = ArrayD::zeros(IxDyn(&[t.len(), 1]));
        self.sde.marginal_prob(&placeholder, t).1
    }

    /// `(labels, output_scale)` for the time vector `t`.
    fn labels_and_scale(&self, t: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
        let n = self.sde.num_scales();
        let t_end = self.sde.t_end();
        match self.sde.kind() {
            SdeKind::VariancePreserving | SdeKind::SubVariancePreserving => {
                let discrete = match (self.continuous, self.sde.kind(), self.sde.discrete()) {
                    (false, SdeKind::VariancePreserving, Some(DiscreteSchedule::Betas(b))) => {
                        Some(b)
                    }
                    _ => None,
                };
                match discrete {
                    Some(schedule) => {
                        let labels = t.mapv(|ti| ti * (n - 1) as f64);
                        let scale = t.mapv(|ti| {
                            -1.0 / schedule.sqrt_one_minus_alphas_cumprod[time_index(ti, t_end, n)]
                        });
                        (labels, scale)
                    }
                    None => {
                        let labels = t.mapv(|ti| 999.0 * ti);
                        let scale = self.marginal_std(t).mapv(|s| -1.0 / s);
                        (labels, scale)
                    }
                }
            }
            SdeKind::VarianceExploding => {
                let labels = if self.continuous {
                    self.marginal_std(t)
                } else {
                    t.mapv(|ti| ((t_end - ti) * (n - 1) as f64).round())
                };
                (labels, Array1::ones(t.len()))
            }
            SdeKind::Other => (t.clone(), Array1::ones(t.len())),
        }
    }
}

impl<'a, S, M> ScoreFn for ModelScore<'a, S, M>
where
    S: Sde + ?Sized,
    M: ScoreModel + ?Sized,
{
    fn score(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> Result<ArrayD<f64>> {
        let (labels, scale) = self.labels_and_scale(t);
        let out = self.model.forward(x, &labels);
        batch::check_shape("score model output", x.shape(), out.shape())?;
        Ok(batch::scale_items(&out, &scale))
    }

    fn score_jacobian_probe(
        &self,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
        v: &ArrayD<f64>,
    ) -> Result<Array1<f64>> {
        let (labels, scale) = self.labels_and_scale(t);
        let probe = self.model.jacobian_probe(x, &labels, v);
        batch::check_shape("score model probe", &[batch::batch_size(x)], probe.shape())?;
        Ok(probe * &scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sde::{SubVpSde, VeSde, VpSde};
    use crate::Error;
    use ndarray::array;
    use std::cell::RefCell;

    #[test]
    fn vp_continuous_labels_and_scaling() {
        let sde = VpSde::new(0.1, 20.0, 1000).unwrap();
        let seen = RefCell::new(Array1::zeros(0));
        let model = |x: &ArrayD<f64>, labels: &Array1<f64>| {
            *seen.borrow_mut() = labels.clone();
            ArrayD::from_elem(x.raw_dim(), 1.0)
        };
        let score = ModelScore::new(&sde, &model, true);
        let x = ArrayD::zeros(IxDyn(&[2, 3]));
        let t = array![0.5, 1.0];
        let s = score.score(&x, &t).unwrap();

        assert_eq!(*seen.borrow(), array![499.5, 999.0]);
        let (_, std) = sde.marginal_prob(&x, &t);
        for b in 0..2 {
            for v in s.index_axis(ndarray::Axis(0), b).iter() {
                assert!((v + 1.0 / std[b]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn vp_discrete_uses_schedule_std() {
        let sde = VpSde::new(0.1, 20.0, 1000).unwrap();
        let model = |x: &ArrayD<f64>, _l: &Array1<f64>| ArrayD::from_elem(x.raw_dim(), 1.0);
        let score = ModelScore::new(&sde, &model, false);
        let x = ArrayD::zeros(IxDyn(&[1, 1]));
        let t = array![500.0 / 999.0];
        let s = score.score(&x, &t).unwrap();
        let expected = -1.0 / sde.schedule().sqrt_one_minus_alphas_cumprod[500];
        assert!((s[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn subvp_is_always_continuous() {
        let sde = SubVpSde::new(0.1, 20.0, 1000).unwrap();
        let seen = RefCell::new(Array1::zeros(0));
        let model = |x: &ArrayD<f64>, labels: &Array1<f64>| {
            *seen.borrow_mut() = labels.clone();
            ArrayD::zeros(x.raw_dim())
        };
        let score = ModelScore::new(&sde, &model, false);
        score
            .score(&ArrayD::zeros(IxDyn(&[1, 2])), &array![0.25])
            .unwrap();
        assert_eq!(*seen.borrow(), array![249.75]);
    }

    #[test]
    fn ve_labels_are_sigma_or_reversed_index() {
        let sde = VeSde::new(0.01, 50.0, 1000).unwrap();
        let seen = RefCell::new(Array1::zeros(0));
        let model = |x: &ArrayD<f64>, labels: &Array1<f64>| {
            *seen.borrow_mut() = labels.clone();
            ArrayD::from_elem(x.raw_dim(), 2.0)
        };
        let x = ArrayD::zeros(IxDyn(&[1, 2]));
        let t = array![1.0];

        let s = ModelScore::new(&sde, &model, true).score(&x, &t).unwrap();
        assert!((seen.borrow()[0] - 50.0).abs() < 1e-9);
        assert!(s.iter().all(|&v| v == 2.0), "VE output is not rescaled");

        ModelScore::new(&sde, &model, false).score(&x, &array![0.0]).unwrap();
        assert_eq!(seen.borrow()[0], 999.0);
    }

    #[test]
    fn model_output_shape_is_checked() {
        let sde = VeSde::new(0.01, 50.0, 10).unwrap();
        let model = |_x: &ArrayD<f64>, _l: &Array1<f64>| ArrayD::zeros(IxDyn(&[1, 3]));
        let score = ModelScore::new(&sde, &model, true);
        let err = score.score(&ArrayD::zeros(IxDyn(&[1, 2])), &array![0.5]);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn probe_is_exact_for_linear_models_and_follows_output_scale() {
        // forward(x) = -x  =>  v^T J v = -|v|^2, then scaled by -1/std(t).
        let sde = VpSde::new(0.1, 20.0, 1000).unwrap();
        let model = |x: &ArrayD<f64>, _l: &Array1<f64>| -x.clone();
        let score = ModelScore::new(&sde, &model, true);
        let x = array![[0.3, -1.2, 4.0]].into_dyn();
        let v = array![[1.0, -1.0, 1.0]].into_dyn();
        let t = array![0.7];
        let probe = score.score_jacobian_probe(&x, &t, &v).unwrap();
        let (_, std) = sde.marginal_prob(&x, &t);
        assert!((probe[0] - 3.0 / std[0]).abs() < 1e-8);
    }
}
