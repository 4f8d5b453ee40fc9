//! Predictors: one reverse-time step from `t` towards `t - T/N`.
//!
//! Every update returns `(x, x_mean)`: the noisy next state and its noise-free mean. The mean
//! is what a sampler emits on its last step when denoising is enabled.

use crate::batch::{self, scale_items};
use crate::score::{self, ScoreFn};
use crate::sde::{time_index, DiscreteSchedule, Sde, SdeKind};
use crate::{Error, Result};
use ndarray::{Array1, ArrayD};
use rand::Rng;

/// Reverse-time step rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Predictor {
    /// Euler-Maruyama on the reverse SDE with `dt = -T/N`.
    EulerMaruyama,
    /// Reverse of the forward discretization.
    #[default]
    ReverseDiffusion,
    /// Closed-form ancestral step of the discrete model (DDPM for VP, SMLD for VE).
    AncestralSampling,
    /// Identity: `(x, x)`.
    None,
}

impl Predictor {
    /// Reject combinations that cannot run, before any sampling starts.
    pub fn validate<S: Sde + ?Sized>(self, sde: &S, probability_flow: bool) -> Result<()> {
        match self {
            Predictor::AncestralSampling => {
                if probability_flow {
                    return Err(Error::Configuration(
                        "ancestral sampling does not support probability flow",
                    ));
                }
                match (sde.kind(), sde.discrete()) {
                    (SdeKind::VarianceExploding, Some(DiscreteSchedule::Sigmas(_))) => Ok(()),
                    (SdeKind::VariancePreserving, Some(DiscreteSchedule::Betas(schedule))) => {
                        schedule.check_discrete_rules()
                    }
                    _ => Err(Error::Configuration(
                        "ancestral sampling requires a VE or VP SDE",
                    )),
                }
            }
            // VP reverse diffusion goes through the DDPM discretization.
            Predictor::ReverseDiffusion => match (sde.kind(), sde.discrete()) {
                (SdeKind::VariancePreserving, Some(DiscreteSchedule::Betas(schedule))) => {
                    schedule.check_discrete_rules()
                }
                _ => Ok(()),
            },
            Predictor::EulerMaruyama | Predictor::None => Ok(()),
        }
    }

    pub fn update<S, F, R>(
        self,
        sde: &S,
        score: &F,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
        probability_flow: bool,
        rng: &mut R,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)>
    where
        S: Sde + ?Sized,
        F: ScoreFn + ?Sized,
        R: Rng + ?Sized,
    {
        match self {
            Predictor::EulerMaruyama => {
                let dt = -sde.t_end() / sde.num_scales() as f64;
                let (drift, diffusion) = sde.reverse(score, probability_flow).drift_diffusion(x, t)?;
                let x_mean = x + &(drift * dt);
                let z = batch::randn(x.shape(), rng);
                let x = &x_mean + &scale_items(&z, &diffusion.mapv(|g| g * (-dt).sqrt()));
                Ok((x, x_mean))
            }
            Predictor::ReverseDiffusion => {
                let (f, g) = sde.reverse(score, probability_flow).discretize(x, t)?;
                let x_mean = x - &f;
                let z = batch::randn(x.shape(), rng);
                let x = &x_mean + &scale_items(&z, &g);
                Ok((x, x_mean))
            }
            Predictor::AncestralSampling => {
                self.validate(sde, probability_flow)?;
                ancestral(sde, score, x, t, rng)
            }
            Predictor::None => Ok((x.clone(), x.clone())),
        }
    }
}

fn ancestral<S, F, R>(
    sde: &S,
    score: &F,
    x: &ArrayD<f64>,
    t: &Array1<f64>,
    rng: &mut R,
) -> Result<(ArrayD<f64>, ArrayD<f64>)>
where
    S: Sde + ?Sized,
    F: ScoreFn + ?Sized,
    R: Rng + ?Sized,
{
    let n = sde.num_scales();
    let t_end = sde.t_end();
    let s = score::evaluate(score, x, t)?;
    let (x_mean, std) = match sde.discrete() {
        Some(DiscreteSchedule::Sigmas(sigmas)) => {
            // x_mean = x + s (σ_i² − σ_{i−1}²); std² = σ_{i−1}²(σ_i² − σ_{i−1}²)/σ_i²
            let mut step = Array1::zeros(t.len());
            let mut std = Array1::zeros(t.len());
            for (b, &ti) in t.iter().enumerate() {
                let i = time_index(ti, t_end, n);
                let sigma2 = sigmas[i] * sigmas[i];
                let adj2 = if i == 0 { 0.0 } else { sigmas[i - 1] * sigmas[i - 1] };
                step[b] = sigma2 - adj2;
                std[b] = (adj2 * (sigma2 - adj2) / sigma2).sqrt();
            }
            (x + &scale_items(&s, &step), std)
        }
        Some(DiscreteSchedule::Betas(schedule)) => {
            // x_mean = (x + β_i s) / sqrt(1 − β_i); std = sqrt(β_i)
            let beta = t.mapv(|ti| schedule.betas[time_index(ti, t_end, n)]);
            let shifted = x + &scale_items(&s, &beta);
            let x_mean = scale_items(&shifted, &beta.mapv(|b| 1.0 / (1.0 - b).sqrt()));
            (x_mean, beta.mapv(f64::sqrt))
        }
        None => {
            return Err(Error::Configuration(
                "ancestral sampling requires a VE or VP SDE",
            ))
        }
    };
    let z = batch::randn(x.shape(), rng);
    let x = &x_mean + &scale_items(&z, &std);
    Ok((x, x_mean))
}
