//! Correctors: score-driven MCMC at a fixed noise level.
//!
//! Step sizes are chosen per batch item from a target signal-to-noise ratio, so one badly
//! conditioned item never shrinks the steps of the others.

use crate::batch::{self, item_norms, scale_items};
use crate::score::{self, ScoreFn};
use crate::sde::{time_index, DiscreteSchedule, Sde};
use crate::{Error, Result};
use ndarray::{Array1, ArrayD};
use rand::Rng;

/// MCMC refinement rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Corrector {
    /// Langevin dynamics, step \(2\alpha(\mathrm{snr}\,\|z\|/\|\nabla\|)^2\).
    ///
    /// The step uses per-item norms, which only concentrate for high-dimensional items; with a
    /// handful of coordinates per item the step is heavy-tailed and can blow up near the mode.
    #[default]
    Langevin,
    /// Annealed Langevin dynamics, step \(2\alpha(\mathrm{snr}\,\sigma_t)^2\).
    AnnealedLangevin,
    /// Identity: `(x, x)`.
    None,
}

impl Corrector {
    pub fn validate<S: Sde + ?Sized>(self, sde: &S, snr: f64) -> Result<()> {
        if self == Corrector::None {
            return Ok(());
        }
        if !(snr > 0.0) || !snr.is_finite() {
            return Err(Error::Configuration("snr must be positive and finite"));
        }
        match sde.discrete() {
            Some(DiscreteSchedule::Betas(schedule)) => schedule.check_discrete_rules(),
            Some(DiscreteSchedule::Sigmas(_)) => Ok(()),
            None if self == Corrector::AnnealedLangevin => Err(Error::Configuration(
                "annealed Langevin requires a VE, VP or sub-VP SDE",
            )),
            None => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update<S, F, R>(
        self,
        sde: &S,
        score: &F,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
        snr: f64,
        n_steps: usize,
        rng: &mut R,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)>
    where
        S: Sde + ?Sized,
        F: ScoreFn + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            Corrector::None => Ok((x.clone(), x.clone())),
            Corrector::Langevin => {
                let alpha = langevin_alpha(sde, t);
                let mut x = x.clone();
                let mut x_mean = x.clone();
                for _ in 0..n_steps {
                    let grad = score::evaluate(score, &x, t)?;
                    let noise = batch::randn(x.shape(), rng);
                    let grad_norm = item_norms(&grad);
                    let noise_norm = item_norms(&noise);
                    let step = Array1::from_iter(
                        grad_norm
                            .iter()
                            .zip(noise_norm.iter())
                            .zip(alpha.iter())
                            .map(|((&g, &z), &a)| {
                                // A vanishing score carries no direction to move in.
                                if g > 0.0 {
                                    let r = snr * z / g;
                                    2.0 * a * r * r
                                } else {
                                    0.0
                                }
                            }),
                    );
                    x_mean = &x + &scale_items(&grad, &step);
                    x = &x_mean + &scale_items(&noise, &step.mapv(|s| (2.0 * s).sqrt()));
                }
                Ok((x, x_mean))
            }
            Corrector::AnnealedLangevin => {
                self.validate(sde, snr)?;
                let alpha = langevin_alpha(sde, t);
                let (_, std) = sde.marginal_prob(x, t);
                let step = Array1::from_iter(
                    std.iter()
                        .zip(alpha.iter())
                        .map(|(&s, &a)| 2.0 * a * (snr * s) * (snr * s)),
                );
                let noise_scale = step.mapv(|s| (2.0 * s).sqrt());
                let mut x = x.clone();
                let mut x_mean = x.clone();
                for _ in 0..n_steps {
                    let grad = score::evaluate(score, &x, t)?;
                    let noise = batch::randn(x.shape(), rng);
                    x_mean = &x + &scale_items(&grad, &step);
                    x = &x_mean + &scale_items(&noise, &noise_scale);
                }
                Ok((x, x_mean))
            }
        }
    }
}

/// \(\alpha_i\) of the discrete DDPM schedule for VP-family SDEs, `1` otherwise.
fn langevin_alpha<S: Sde + ?Sized>(sde: &S, t: &Array1<f64>) -> Array1<f64> {
    match sde.discrete() {
        Some(DiscreteSchedule::Betas(schedule)) => {
            let (t_end, n) = (sde.t_end(), sde.num_scales());
            t.mapv(|ti| schedule.alphas[time_index(ti, t_end, n)])
        }
        _ => Array1::ones(t.len()),
    }
}
