//! Samplers: predictor-corrector and probability-flow ODE.
//!
//! A sampler is built once from an SDE, a target shape and a config. Construction validates
//! everything that could fail for configuration reasons, so `sample` only fails on shape
//! mismatches at the call boundary or on numerical trouble inside the solver.

use crate::batch::{self, full_t};
use crate::corrector::Corrector;
use crate::ode::OdeSolver;
use crate::predictor::Predictor;
use crate::scaler::DataScaler;
use crate::score::{ModelScore, ScoreModel};
use crate::sde::{linspace, Sde};
use crate::{Error, Result};
use ndarray::{Array1, ArrayD};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

/// Predictor-corrector sampler configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PcSamplerConfig {
    pub predictor: Predictor,
    pub corrector: Corrector,
    /// Target signal-to-noise ratio of the corrector.
    pub snr: f64,
    /// Corrector iterations per noise level.
    pub n_steps: usize,
    /// Run the predictor on the probability-flow ODE instead of the reverse SDE.
    pub probability_flow: bool,
    /// Whether the score model was trained with continuous time labels.
    pub continuous: bool,
    /// Emit the noise-free mean of the last predictor step.
    pub denoise: bool,
    /// Terminal time; the reverse process stops at `eps` instead of `0`.
    pub eps: f64,
    pub scaler: DataScaler,
}

impl Default for PcSamplerConfig {
    fn default() -> Self {
        Self {
            predictor: Predictor::ReverseDiffusion,
            corrector: Corrector::Langevin,
            snr: 0.16,
            n_steps: 1,
            probability_flow: false,
            continuous: true,
            denoise: true,
            eps: 1e-3,
            scaler: DataScaler::Identity,
        }
    }
}

impl PcSamplerConfig {
    pub fn validate<S: Sde + ?Sized>(&self, sde: &S) -> Result<()> {
        validate_eps(self.eps, sde.t_end())?;
        self.predictor.validate(sde, self.probability_flow)?;
        self.corrector.validate(sde, self.snr)?;
        Ok(())
    }
}

fn validate_eps(eps: f64, t_end: f64) -> Result<()> {
    if !(eps > 0.0) || !(eps < t_end) {
        return Err(Error::Configuration("eps must lie in (0, T)"));
    }
    Ok(())
}

fn initial_state<S, R>(
    sde: &S,
    shape: &[usize],
    latent: Option<&ArrayD<f64>>,
    rng: &mut R,
) -> Result<ArrayD<f64>>
where
    S: Sde + ?Sized,
    R: rand::Rng + ?Sized,
{
    match latent {
        Some(z) => {
            batch::check_shape("initial latent", shape, z.shape())?;
            Ok(z.clone())
        }
        None => Ok(sde.prior_sampling(shape, rng)),
    }
}

/// Predictor-corrector sampler.
///
/// At each of the `N` times `linspace(T, eps, N)` the corrector refines `x` at the current
/// noise level, then the predictor moves it one step towards `eps`.
#[derive(Debug, Clone)]
pub struct PcSampler<S> {
    sde: S,
    shape: Vec<usize>,
    config: PcSamplerConfig,
    timesteps: Array1<f64>,
}

impl<S: Sde> PcSampler<S> {
    pub fn new(sde: S, shape: &[usize], config: PcSamplerConfig) -> Result<Self> {
        batch::validate_shape(shape)?;
        config.validate(&sde)?;
        let timesteps = linspace(sde.t_end(), config.eps, sde.num_scales());
        Ok(Self {
            sde,
            shape: shape.to_vec(),
            config,
            timesteps,
        })
    }

    pub fn sde(&self) -> &S {
        &self.sde
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn config(&self) -> &PcSamplerConfig {
        &self.config
    }

    /// The decreasing time grid `linspace(T, eps, N)`.
    pub fn timesteps(&self) -> &Array1<f64> {
        &self.timesteps
    }

    /// Score evaluations per `sample` call, `N * (n_steps + 1)`.
    ///
    /// This is the nominal count of the standard algorithm: it is reported even when the
    /// predictor or corrector is `None`.
    pub fn evaluations(&self) -> usize {
        self.sde.num_scales() * (self.config.n_steps + 1)
    }

    /// Draw a batch. Starts from `latent` if given (shape must match), otherwise from the prior.
    ///
    /// Returns `(samples, nfe)`, samples in data space (after the inverse scaler).
    pub fn sample<M>(
        &self,
        model: &M,
        latent: Option<&ArrayD<f64>>,
        seed: u64,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
    {
        let cfg = &self.config;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let score = ModelScore::new(&self.sde, model, cfg.continuous);
        let mut x = initial_state(&self.sde, &self.shape, latent, &mut rng)?;
        let mut x_mean = x.clone();
        let b = self.shape[0];

        debug!(
            n = self.sde.num_scales(),
            predictor = ?cfg.predictor,
            corrector = ?cfg.corrector,
            "pc sampling start"
        );
        for (i, &t) in self.timesteps.iter().enumerate() {
            let vec_t = full_t(b, t);
            let (xc, _) = cfg
                .corrector
                .update(&self.sde, &score, &x, &vec_t, cfg.snr, cfg.n_steps, &mut rng)?;
            let (xp, xp_mean) = cfg.predictor.update(
                &self.sde,
                &score,
                &xc,
                &vec_t,
                cfg.probability_flow,
                &mut rng,
            )?;
            x = xp;
            x_mean = xp_mean;
            trace!(step = i, t, "pc step");
        }

        let nfe = self.evaluations();
        debug!(nfe, "pc sampling done");
        let out = if cfg.denoise { x_mean } else { x };
        Ok((cfg.scaler.inverse(&out), nfe))
    }
}

/// Probability-flow ODE sampler configuration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OdeSamplerConfig {
    pub solver: OdeSolver,
    pub eps: f64,
    /// Finish with one noise-free reverse-diffusion step at `eps`.
    pub denoise: bool,
    pub scaler: DataScaler,
}

impl Default for OdeSamplerConfig {
    fn default() -> Self {
        Self {
            solver: OdeSolver::default(),
            eps: 1e-3,
            denoise: false,
            scaler: DataScaler::Identity,
        }
    }
}

/// Probability-flow ODE sampler: integrates the deterministic reverse dynamics from `T` to
/// `eps`. The same latent always maps to the same sample.
#[derive(Debug, Clone)]
pub struct OdeSampler<S> {
    sde: S,
    shape: Vec<usize>,
    config: OdeSamplerConfig,
}

impl<S: Sde> OdeSampler<S> {
    pub fn new(sde: S, shape: &[usize], config: OdeSamplerConfig) -> Result<Self> {
        batch::validate_shape(shape)?;
        validate_eps(config.eps, sde.t_end())?;
        config.solver.validate()?;
        if config.denoise {
            Predictor::ReverseDiffusion.validate(&sde, false)?;
        }
        Ok(Self {
            sde,
            shape: shape.to_vec(),
            config,
        })
    }

    pub fn sde(&self) -> &S {
        &self.sde
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn config(&self) -> &OdeSamplerConfig {
        &self.config
    }

    /// Returns `(samples, nfe)` where `nfe` is the solver's evaluation count (plus one for
    /// the denoising step).
    pub fn sample<M>(
        &self,
        model: &M,
        latent: Option<&ArrayD<f64>>,
        seed: u64,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
    {
        let cfg = &self.config;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        // The ODE is defined in continuous time.
        let score = ModelScore::new(&self.sde, model, true);
        let x0 = initial_state(&self.sde, &self.shape, latent, &mut rng)?;
        let shape = self.shape.clone();
        let b = shape[0];
        let flow = self.sde.reverse(&score, true);

        debug!(t_end = self.sde.t_end(), eps = cfg.eps, "ode sampling start");
        let sol = cfg.solver.solve(
            &batch::flatten(&x0),
            self.sde.t_end(),
            cfg.eps,
            |y, t| {
                let x = batch::unflatten(y, &shape)?;
                let (drift, _) = flow.drift_diffusion(&x, &full_t(b, t))?;
                Ok(batch::flatten(&drift))
            },
        )?;
        let mut nfe = sol.nfe;
        let mut x = batch::unflatten(&sol.y.view(), &shape)?;

        if cfg.denoise {
            let (_, x_mean) = Predictor::ReverseDiffusion.update(
                &self.sde,
                &score,
                &x,
                &full_t(b, cfg.eps),
                false,
                &mut rng,
            )?;
            x = x_mean;
            nfe += 1;
        }
        debug!(nfe, accepted = sol.accepted, rejected = sol.rejected, "ode sampling done");
        Ok((cfg.scaler.inverse(&x), nfe))
    }
}

/// Either sampler behind one `sample` entry point.
#[derive(Debug, Clone)]
pub enum Sampler<S> {
    Pc(PcSampler<S>),
    Ode(OdeSampler<S>),
}

impl<S: Sde> Sampler<S> {
    pub fn shape(&self) -> &[usize] {
        match self {
            Sampler::Pc(s) => s.shape(),
            Sampler::Ode(s) => s.shape(),
        }
    }

    pub fn sample<M>(
        &self,
        model: &M,
        latent: Option<&ArrayD<f64>>,
        seed: u64,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
    {
        match self {
            Sampler::Pc(s) => s.sample(model, latent, seed),
            Sampler::Ode(s) => s.sample(model, latent, seed),
        }
    }
}

impl<S> From<PcSampler<S>> for Sampler<S> {
    fn from(s: PcSampler<S>) -> Self {
        Sampler::Pc(s)
    }
}

impl<S> From<OdeSampler<S>> for Sampler<S> {
    fn from(s: OdeSampler<S>) -> Self {
        Sampler::Ode(s)
    }
}
