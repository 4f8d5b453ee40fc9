//! Forward diffusions and their reverse-time counterparts.
//!
//! An SDE here is a set of capabilities (drift/diffusion, closed-form marginals, prior, a
//! single-step discretization) rather than a class hierarchy. Three concrete variants are
//! provided:
//!
//! - [`VeSde`]: variance exploding, \(dx = \sqrt{d[\sigma^2(t)]/dt}\,dw\)
//! - [`VpSde`]: variance preserving, \(dx = -\tfrac12\beta(t)x\,dt + \sqrt{\beta(t)}\,dw\)
//! - [`SubVpSde`]: sub-variance preserving (tighter variance than VP)
//!
//! [`ReverseSde`] is not a fourth variant: it is a value that borrows any forward SDE together
//! with a score function and exposes the reverse-time drift (or the probability-flow ODE drift).
//!
//! Diffusion coefficients and marginal standard deviations depend only on `t`, so they are
//! returned per batch item (`Array1<f64>` of length `B`).

use crate::batch::{self, item_dim, item_sum_sq, scale_items};
use crate::score::{self, ScoreFn};
use crate::{Error, Result};
use ndarray::{Array1, ArrayD};
use rand::Rng;

/// Which family an SDE belongs to.
///
/// Samplers use this to pick closed-form updates (ancestral sampling) and the score adapter
/// uses it to pick the network's label convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdeKind {
    VarianceExploding,
    VariancePreserving,
    SubVariancePreserving,
    /// Any other diffusion; scored with raw `t` labels and no output rescaling.
    Other,
}

/// The discrete-time noise levels an SDE was trained against (if any).
#[derive(Debug, Clone, Copy)]
pub enum DiscreteSchedule<'a> {
    /// Geometric noise scales \(\sigma_0 < \dots < \sigma_{N-1}\) (NCSN / SMLD).
    Sigmas(&'a Array1<f64>),
    /// Linear DDPM β schedule and its derived products.
    Betas(&'a BetaSchedule),
}

/// Discrete DDPM schedule: `betas = linspace(beta_min/N, beta_max/N, N)`.
#[derive(Debug, Clone)]
pub struct BetaSchedule {
    pub betas: Array1<f64>,
    pub alphas: Array1<f64>,
    pub alphas_cumprod: Array1<f64>,
    pub sqrt_alphas_cumprod: Array1<f64>,
    pub sqrt_one_minus_alphas_cumprod: Array1<f64>,
}

impl BetaSchedule {
    pub fn linear(beta_min: f64, beta_max: f64, n: usize) -> Self {
        let nf = n as f64;
        let betas = linspace(beta_min / nf, beta_max / nf, n);
        let alphas = betas.mapv(|b| 1.0 - b);
        let mut alphas_cumprod = Array1::<f64>::zeros(n);
        let mut acc = 1.0f64;
        for i in 0..n {
            acc *= alphas[i];
            alphas_cumprod[i] = acc;
        }
        let sqrt_alphas_cumprod = alphas_cumprod.mapv(f64::sqrt);
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.mapv(|a| (1.0 - a).sqrt());
        Self {
            betas,
            alphas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        }
    }

    /// Rules that read `alphas` need every \(\beta_i < 1\), i.e. `beta_max / N < 1`.
    pub fn check_discrete_rules(&self) -> Result<()> {
        if self.betas.iter().all(|&b| b < 1.0) {
            Ok(())
        } else {
            Err(Error::Configuration(
                "discrete beta schedule needs beta_max / N < 1",
            ))
        }
    }
}

/// `n` evenly spaced points from `a` to `b` inclusive (`[a]` when `n == 1`).
pub fn linspace(a: f64, b: f64, n: usize) -> Array1<f64> {
    if n <= 1 {
        return Array1::from_elem(n, a);
    }
    let step = (b - a) / ((n - 1) as f64);
    Array1::from_iter((0..n).map(|i| if i + 1 == n { b } else { a + step * i as f64 }))
}

/// Discrete level of a continuous time: `floor(t (N-1) / T)`, clamped to `[0, N-1]`.
///
/// The small tolerance keeps grid times like `i/(N-1)` from truncating to `i-1`.
#[inline]
pub fn time_index(t: f64, t_end: f64, n: usize) -> usize {
    let last = n.saturating_sub(1);
    let raw = (t * last as f64 / t_end + 1e-9).floor();
    if !(raw > 0.0) {
        0
    } else {
        (raw as usize).min(last)
    }
}

/// Isotropic Gaussian log-density per batch item: \(\mathcal N(0, \mathrm{var}\,I)\).
fn isotropic_gaussian_logp(z: &ArrayD<f64>, var: f64) -> Array1<f64> {
    let d = item_dim(z.shape()) as f64;
    let norm = -0.5 * d * (2.0 * core::f64::consts::PI * var).ln();
    item_sum_sq(z).mapv(|s| norm - s / (2.0 * var))
}

/// Capability set of a forward diffusion.
pub trait Sde {
    fn kind(&self) -> SdeKind;

    /// Number of discretization steps `N`.
    fn num_scales(&self) -> usize;

    /// End time `T`.
    fn t_end(&self) -> f64 {
        1.0
    }

    /// `(f(x,t), g(t))`.
    fn drift_diffusion(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>);

    /// Closed-form forward transition: mean and std of \(p_{0t}(x_t \mid x_0)\).
    fn marginal_prob(&self, x0: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>);

    /// Draw from \(p_T\).
    fn prior_sampling<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f64>;

    /// \(\log p_T(z)\) per batch item.
    fn prior_logp(&self, z: &ArrayD<f64>) -> Array1<f64>;

    /// Single-step coefficients `(f, G)` so that
    /// \(x_{i+1} = x_i + f_i(x_i) + G_i z_i\).
    ///
    /// Default: Euler-Maruyama with step `T/N`.
    fn discretize(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let dt = self.t_end() / self.num_scales() as f64;
        let (drift, diffusion) = self.drift_diffusion(x, t);
        (drift * dt, diffusion * dt.sqrt())
    }

    /// Discrete noise levels, if this SDE has a discrete-time counterpart.
    fn discrete(&self) -> Option<DiscreteSchedule<'_>> {
        None
    }

    /// Reverse-time SDE (or probability-flow ODE) driven by `score`.
    fn reverse<'a, F>(&'a self, score: &'a F, probability_flow: bool) -> ReverseSde<'a, Self, F>
    where
        F: ScoreFn + ?Sized,
    {
        ReverseSde {
            sde: self,
            score,
            probability_flow,
        }
    }
}

// -----------------------------------------------------------------------------
// VE
// -----------------------------------------------------------------------------

/// Variance-exploding SDE.
#[derive(Debug, Clone)]
pub struct VeSde {
    sigma_min: f64,
    sigma_max: f64,
    n: usize,
    discrete_sigmas: Array1<f64>,
}

impl VeSde {
    pub fn new(sigma_min: f64, sigma_max: f64, n: usize) -> Result<Self> {
        if n == 0 {
            return Err(Error::Configuration("N must be >= 1"));
        }
        if !(sigma_min > 0.0) || !sigma_min.is_finite() || !sigma_max.is_finite() {
            return Err(Error::Configuration("sigma_min must be positive and finite"));
        }
        if sigma_min >= sigma_max {
            return Err(Error::Configuration("sigma_min must be < sigma_max"));
        }
        let discrete_sigmas = linspace(sigma_min.ln(), sigma_max.ln(), n).mapv(f64::exp);
        Ok(Self {
            sigma_min,
            sigma_max,
            n,
            discrete_sigmas,
        })
    }

    pub fn sigma_min(&self) -> f64 {
        self.sigma_min
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigma_max
    }

    /// \(\sigma(t) = \sigma_{min} (\sigma_{max}/\sigma_{min})^t\).
    #[inline]
    pub fn sigma(&self, t: f64) -> f64 {
        self.sigma_min * (self.sigma_max / self.sigma_min).powf(t)
    }

    pub fn discrete_sigmas(&self) -> &Array1<f64> {
        &self.discrete_sigmas
    }

    /// `(sigma_i, sigma_{i-1})` for the level of `t`, with `sigma_{-1} = 0`.
    pub(crate) fn adjacent_sigmas(&self, t: f64) -> (f64, f64) {
        let i = time_index(t, self.t_end(), self.n);
        let sigma = self.discrete_sigmas[i];
        let adjacent = if i == 0 {
            0.0
        } else {
            self.discrete_sigmas[i - 1]
        };
        (sigma, adjacent)
    }
}

impl Sde for VeSde {
    fn kind(&self) -> SdeKind {
        SdeKind::VarianceExploding
    }

    fn num_scales(&self) -> usize {
        self.n
    }

    fn drift_diffusion(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let rate = (2.0 * (self.sigma_max.ln() - self.sigma_min.ln())).sqrt();
        let diffusion = t.mapv(|ti| self.sigma(ti) * rate);
        (ArrayD::zeros(x.raw_dim()), diffusion)
    }

    fn marginal_prob(&self, x0: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        (x0.clone(), t.mapv(|ti| self.sigma(ti)))
    }

    fn prior_sampling<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f64> {
        batch::randn(shape, rng) * self.sigma_max
    }

    fn prior_logp(&self, z: &ArrayD<f64>) -> Array1<f64> {
        isotropic_gaussian_logp(z, self.sigma_max * self.sigma_max)
    }

    fn discretize(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let g = t.mapv(|ti| {
            let (sigma, adjacent) = self.adjacent_sigmas(ti);
            (sigma * sigma - adjacent * adjacent).sqrt()
        });
        (ArrayD::zeros(x.raw_dim()), g)
    }

    fn discrete(&self) -> Option<DiscreteSchedule<'_>> {
        Some(DiscreteSchedule::Sigmas(&self.discrete_sigmas))
    }
}

// -----------------------------------------------------------------------------
// VP / sub-VP
// -----------------------------------------------------------------------------

fn validate_betas(beta_min: f64, beta_max: f64, n: usize) -> Result<()> {
    if n == 0 {
        return Err(Error::Configuration("N must be >= 1"));
    }
    if !(beta_min >= 0.0) || !beta_min.is_finite() || !beta_max.is_finite() {
        return Err(Error::Configuration("beta_min must be finite and >= 0"));
    }
    if beta_min >= beta_max {
        return Err(Error::Configuration("beta_min must be < beta_max"));
    }
    Ok(())
}

#[inline]
fn beta_at(beta_min: f64, beta_max: f64, t: f64) -> f64 {
    beta_min + t * (beta_max - beta_min)
}

/// \(\log\) of the VP mean coefficient: \(-\tfrac14 t^2(\beta_1-\beta_0) - \tfrac12 t\beta_0\).
#[inline]
fn log_mean_coeff(beta_min: f64, beta_max: f64, t: f64) -> f64 {
    -0.25 * t * t * (beta_max - beta_min) - 0.5 * t * beta_min
}

/// Variance-preserving SDE (continuous DDPM).
#[derive(Debug, Clone)]
pub struct VpSde {
    beta_min: f64,
    beta_max: f64,
    n: usize,
    schedule: BetaSchedule,
}

impl VpSde {
    pub fn new(beta_min: f64, beta_max: f64, n: usize) -> Result<Self> {
        validate_betas(beta_min, beta_max, n)?;
        Ok(Self {
            beta_min,
            beta_max,
            n,
            schedule: BetaSchedule::linear(beta_min, beta_max, n),
        })
    }

    pub fn beta_min(&self) -> f64 {
        self.beta_min
    }

    pub fn beta_max(&self) -> f64 {
        self.beta_max
    }

    #[inline]
    pub fn beta(&self, t: f64) -> f64 {
        beta_at(self.beta_min, self.beta_max, t)
    }

    pub fn schedule(&self) -> &BetaSchedule {
        &self.schedule
    }
}

impl Sde for VpSde {
    fn kind(&self) -> SdeKind {
        SdeKind::VariancePreserving
    }

    fn num_scales(&self) -> usize {
        self.n
    }

    fn drift_diffusion(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let beta = t.mapv(|ti| self.beta(ti));
        let drift = scale_items(x, &beta.mapv(|b| -0.5 * b));
        (drift, beta.mapv(f64::sqrt))
    }

    fn marginal_prob(&self, x0: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let lmc = t.mapv(|ti| log_mean_coeff(self.beta_min, self.beta_max, ti));
        let mean = scale_items(x0, &lmc.mapv(f64::exp));
        let std = lmc.mapv(|l| (1.0 - (2.0 * l).exp()).sqrt());
        (mean, std)
    }

    fn prior_sampling<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f64> {
        batch::randn(shape, rng)
    }

    fn prior_logp(&self, z: &ArrayD<f64>) -> Array1<f64> {
        isotropic_gaussian_logp(z, 1.0)
    }

    /// DDPM discretization: \(f = (\sqrt{\alpha_i} - 1)x\), \(G = \sqrt{\beta_i}\).
    fn discretize(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let idx: Vec<usize> = t
            .iter()
            .map(|&ti| time_index(ti, self.t_end(), self.n))
            .collect();
        let f_coeff = Array1::from_iter(idx.iter().map(|&i| self.schedule.alphas[i].sqrt() - 1.0));
        let g = Array1::from_iter(idx.iter().map(|&i| self.schedule.betas[i].sqrt()));
        (scale_items(x, &f_coeff), g)
    }

    fn discrete(&self) -> Option<DiscreteSchedule<'_>> {
        Some(DiscreteSchedule::Betas(&self.schedule))
    }
}

/// Sub-VP SDE: VP drift with diffusion
/// \(\sqrt{\beta(t)(1 - e^{-2\beta_0 t - (\beta_1-\beta_0)t^2})}\).
#[derive(Debug, Clone)]
pub struct SubVpSde {
    beta_min: f64,
    beta_max: f64,
    n: usize,
    schedule: BetaSchedule,
}

impl SubVpSde {
    pub fn new(beta_min: f64, beta_max: f64, n: usize) -> Result<Self> {
        validate_betas(beta_min, beta_max, n)?;
        Ok(Self {
            beta_min,
            beta_max,
            n,
            schedule: BetaSchedule::linear(beta_min, beta_max, n),
        })
    }

    pub fn beta_min(&self) -> f64 {
        self.beta_min
    }

    pub fn beta_max(&self) -> f64 {
        self.beta_max
    }

    #[inline]
    pub fn beta(&self, t: f64) -> f64 {
        beta_at(self.beta_min, self.beta_max, t)
    }
}

impl Sde for SubVpSde {
    fn kind(&self) -> SdeKind {
        SdeKind::SubVariancePreserving
    }

    fn num_scales(&self) -> usize {
        self.n
    }

    fn drift_diffusion(&self, x: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let beta = t.mapv(|ti| self.beta(ti));
        let drift = scale_items(x, &beta.mapv(|b| -0.5 * b));
        let diffusion = Array1::from_iter(t.iter().zip(beta.iter()).map(|(&ti, &b)| {
            let discount = 1.0
                - (-2.0 * self.beta_min * ti - (self.beta_max - self.beta_min) * ti * ti).exp();
            (b * discount).sqrt()
        }));
        (drift, diffusion)
    }

    fn marginal_prob(&self, x0: &ArrayD<f64>, t: &Array1<f64>) -> (ArrayD<f64>, Array1<f64>) {
        let lmc = t.mapv(|ti| log_mean_coeff(self.beta_min, self.beta_max, ti));
        let mean = scale_items(x0, &lmc.mapv(f64::exp));
        let std = lmc.mapv(|l| 1.0 - (2.0 * l).exp());
        (mean, std)
    }

    fn prior_sampling<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f64> {
        batch::randn(shape, rng)
    }

    fn prior_logp(&self, z: &ArrayD<f64>) -> Array1<f64> {
        isotropic_gaussian_logp(z, 1.0)
    }

    fn discrete(&self) -> Option<DiscreteSchedule<'_>> {
        Some(DiscreteSchedule::Betas(&self.schedule))
    }
}

// -----------------------------------------------------------------------------
// Reverse
// -----------------------------------------------------------------------------

/// Reverse-time SDE of a forward SDE under a score estimate.
///
/// With `probability_flow = true` this is the probability-flow ODE: the score correction is
/// halved and the diffusion is zero.
pub struct ReverseSde<'a, S: ?Sized, F: ?Sized> {
    sde: &'a S,
    score: &'a F,
    probability_flow: bool,
}

impl<'a, S, F> ReverseSde<'a, S, F>
where
    S: Sde + ?Sized,
    F: ScoreFn + ?Sized,
{
    pub fn probability_flow(&self) -> bool {
        self.probability_flow
    }

    pub fn forward_sde(&self) -> &S {
        self.sde
    }

    fn correction_weight(&self) -> f64 {
        if self.probability_flow {
            0.5
        } else {
            1.0
        }
    }

    /// Reverse drift \(f - g^2 s\) (or \(f - \tfrac12 g^2 s\)) and diffusion.
    pub fn drift_diffusion(
        &self,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
    ) -> Result<(ArrayD<f64>, Array1<f64>)> {
        let (drift, diffusion) = self.sde.drift_diffusion(x, t);
        let s = score::evaluate(self.score, x, t)?;
        let w = self.correction_weight();
        let drift = drift - scale_items(&s, &diffusion.mapv(|g| w * g * g));
        let diffusion = if self.probability_flow {
            Array1::zeros(diffusion.len())
        } else {
            diffusion
        };
        Ok((drift, diffusion))
    }

    /// Reverse discretization: `rev_f = f - G^2 s (·0.5)`, `rev_G = G` (or `0`).
    pub fn discretize(
        &self,
        x: &ArrayD<f64>,
        t: &Array1<f64>,
    ) -> Result<(ArrayD<f64>, Array1<f64>)> {
        let (f, g) = self.sde.discretize(x, t);
        let s = score::evaluate(self.score, x, t)?;
        let w = self.correction_weight();
        let rev_f = f - scale_items(&s, &g.mapv(|gi| w * gi * gi));
        let rev_g = if self.probability_flow {
            Array1::zeros(g.len())
        } else {
            g
        };
        Ok((rev_f, rev_g))
    }
}
