//! Controllable generation with an unconditional score model.
//!
//! Both samplers run the ordinary predictor-corrector loop and, after every corrector and every
//! predictor update, overwrite the known part of the state with a fresh draw from the forward
//! marginal of the observation at the current time. The unknown part is left to the model.
//!
//! - [`PcInpainter`]: known part selected by a pixel mask (`1` = observed).
//! - [`PcColorizer`]: known part is the luminance channel of a decorrelated color space.

use crate::batch::{self, full_t, scale_items};
use crate::sampling::PcSamplerConfig;
use crate::score::{ModelScore, ScoreModel};
use crate::sde::{linspace, Sde};
use crate::{Error, Result};
use std::f64::consts::FRAC_1_SQRT_2;
use ndarray::{Array1, ArrayD, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Shared PC loop with a projection after every update.
#[derive(Debug, Clone)]
struct ConstrainedPc<S> {
    sde: S,
    config: PcSamplerConfig,
    timesteps: Array1<f64>,
}

impl<S: Sde> ConstrainedPc<S> {
    fn new(sde: S, config: PcSamplerConfig) -> Result<Self> {
        config.validate(&sde)?;
        let timesteps = linspace(sde.t_end(), config.eps, sde.num_scales());
        Ok(Self {
            sde,
            config,
            timesteps,
        })
    }

    fn evaluations(&self) -> usize {
        self.sde.num_scales() * (self.config.n_steps + 1)
    }

    /// `impose(x, x_mean, t, rng) -> (x, x_mean)` re-imposes the observation.
    fn run<M, P>(
        &self,
        model: &M,
        init: ArrayD<f64>,
        rng: &mut ChaCha8Rng,
        mut impose: P,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
        P: FnMut(ArrayD<f64>, ArrayD<f64>, &Array1<f64>, &mut ChaCha8Rng) -> (ArrayD<f64>, ArrayD<f64>),
    {
        let cfg = &self.config;
        let score = ModelScore::new(&self.sde, model, cfg.continuous);
        let b = batch::batch_size(&init);
        let mut x = init;
        let mut x_mean = x.clone();

        for &t in self.timesteps.iter() {
            let vec_t = full_t(b, t);
            let (xc, xc_mean) = cfg
                .corrector
                .update(&self.sde, &score, &x, &vec_t, cfg.snr, cfg.n_steps, rng)?;
            let (xc, _) = impose(xc, xc_mean, &vec_t, rng);
            let (xp, xp_mean) =
                cfg.predictor
                    .update(&self.sde, &score, &xc, &vec_t, cfg.probability_flow, rng)?;
            let (xp, xp_mean) = impose(xp, xp_mean, &vec_t, rng);
            x = xp;
            x_mean = xp_mean;
        }

        let out = if cfg.denoise { x_mean } else { x };
        Ok((cfg.scaler.inverse(&out), self.evaluations()))
    }
}

/// Draw `mean + std * z` from the forward marginal of `observed` at `t`.
fn noisy_observation<S, R>(
    sde: &S,
    observed: &ArrayD<f64>,
    t: &Array1<f64>,
    rng: &mut R,
) -> (ArrayD<f64>, ArrayD<f64>)
where
    S: Sde + ?Sized,
    R: rand::Rng + ?Sized,
{
    let (mean, std) = sde.marginal_prob(observed, t);
    let z = batch::randn(observed.shape(), rng);
    let noisy = &mean + &scale_items(&z, &std);
    (noisy, mean)
}

/// `a * (1 - mask) + b * mask`.
fn blend(a: &ArrayD<f64>, b: &ArrayD<f64>, mask: &ArrayD<f64>) -> ArrayD<f64> {
    let mut out = a.clone();
    ndarray::Zip::from(&mut out)
        .and(b)
        .and(mask)
        .for_each(|o, &bv, &m| *o = *o * (1.0 - m) + bv * m);
    out
}

/// PC inpainting: fills the unobserved region of `data` (where `mask == 0`).
#[derive(Debug, Clone)]
pub struct PcInpainter<S> {
    inner: ConstrainedPc<S>,
}

impl<S: Sde> PcInpainter<S> {
    pub fn new(sde: S, config: PcSamplerConfig) -> Result<Self> {
        Ok(Self {
            inner: ConstrainedPc::new(sde, config)?,
        })
    }

    pub fn sde(&self) -> &S {
        &self.inner.sde
    }

    /// `data` is in model space; `mask` has the same shape with entries in `[0, 1]`.
    ///
    /// Returns `(samples, nfe)`.
    pub fn inpaint<M>(
        &self,
        model: &M,
        data: &ArrayD<f64>,
        mask: &ArrayD<f64>,
        seed: u64,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
    {
        batch::validate_shape(data.shape())?;
        batch::check_shape("inpainting mask", data.shape(), mask.shape())?;
        let sde = &self.inner.sde;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let prior = sde.prior_sampling(data.shape(), &mut rng);
        let init = blend(&prior, data, mask);
        debug!(shape = ?data.shape(), "inpainting start");

        self.inner.run(model, init, &mut rng, |x, x_mean, t, rng| {
            let (noisy, mean) = noisy_observation(sde, data, t, rng);
            (blend(&x, &noisy, mask), blend(&x_mean, &mean, mask))
        })
    }
}

/// Orthogonal color transform whose first output channel is scaled luminance:
/// columns are `(1,1,1)/√3`, `(-2,1,1)/√6`, `(0,1,-1)/√2`.
const DECOUPLE: [[f64; 3]; 3] = [
    [INV_SQRT_3, -2.0 * INV_SQRT_6, 0.0],
    [INV_SQRT_3, INV_SQRT_6, FRAC_1_SQRT_2],
    [INV_SQRT_3, INV_SQRT_6, -FRAC_1_SQRT_2],
];

const INV_SQRT_3: f64 = 0.577_350_269_189_625_8;
const INV_SQRT_6: f64 = 0.408_248_290_463_863;

/// `out[:, j] = sum_i x[:, i] * m[i][j]` (or `m[j][i]` when `transpose`).
fn mix_channels(x: &ArrayD<f64>, transpose: bool) -> ArrayD<f64> {
    let mut out = ArrayD::zeros(x.raw_dim());
    for j in 0..3 {
        let mut oj = out.index_axis_mut(Axis(1), j);
        for i in 0..3 {
            let c = if transpose { DECOUPLE[j][i] } else { DECOUPLE[i][j] };
            oj.scaled_add(c, &x.index_axis(Axis(1), i));
        }
    }
    out
}

/// Map RGB (channel axis 1) into the decoupled space.
pub fn decouple(x: &ArrayD<f64>) -> ArrayD<f64> {
    mix_channels(x, false)
}

/// Inverse of [`decouple`] (the transform is orthogonal, so this is its transpose).
pub fn couple(x: &ArrayD<f64>) -> ArrayD<f64> {
    mix_channels(x, true)
}

/// PC colorization: samples color images whose luminance matches a grayscale input.
#[derive(Debug, Clone)]
pub struct PcColorizer<S> {
    inner: ConstrainedPc<S>,
}

impl<S: Sde> PcColorizer<S> {
    pub fn new(sde: S, config: PcSamplerConfig) -> Result<Self> {
        Ok(Self {
            inner: ConstrainedPc::new(sde, config)?,
        })
    }

    pub fn sde(&self) -> &S {
        &self.inner.sde
    }

    /// `gray` has shape `[B, 3, ...]` with identical channels, in model space.
    ///
    /// Returns `(samples, nfe)`.
    pub fn colorize<M>(
        &self,
        model: &M,
        gray: &ArrayD<f64>,
        seed: u64,
    ) -> Result<(ArrayD<f64>, usize)>
    where
        M: ScoreModel + ?Sized,
    {
        batch::validate_shape(gray.shape())?;
        if gray.ndim() < 2 || gray.shape()[1] != 3 {
            let mut expected = gray.shape().to_vec();
            if expected.len() < 2 {
                expected.push(3);
            } else {
                expected[1] = 3;
            }
            return Err(Error::ShapeMismatch {
                what: "colorization input",
                expected,
                got: gray.shape().to_vec(),
            });
        }
        let sde = &self.inner.sde;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut mask = ArrayD::zeros(gray.raw_dim());
        mask.index_axis_mut(Axis(1), 0).fill(1.0);
        let gray_dec = decouple(gray);

        let prior = sde.prior_sampling(gray.shape(), &mut rng);
        let init = couple(&blend(&decouple(&prior), &gray_dec, &mask));
        debug!(shape = ?gray.shape(), "colorization start");

        self.inner.run(model, init, &mut rng, |x, x_mean, t, rng| {
            let (noisy, mean) = noisy_observation(sde, &gray_dec, t, rng);
            (
                couple(&blend(&decouple(&x), &noisy, &mask)),
                couple(&blend(&decouple(&x_mean), &mean, &mask)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corrector::Corrector;
    use crate::sde::{VeSde, VpSde};
    use ndarray::IxDyn;

    fn zero_model(x: &ArrayD<f64>, _l: &Array1<f64>) -> ArrayD<f64> {
        ArrayD::zeros(x.raw_dim())
    }

    #[test]
    fn couple_inverts_decouple() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = batch::randn(&[2, 3, 4, 4], &mut rng);
        let back = couple(&decouple(&x));
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
    }

    #[test]
    fn decouple_matrix_is_orthogonal() {
        for i in 0..3 {
            for j in 0..3 {
                let dot: f64 = (0..3).map(|k| DECOUPLE[k][i] * DECOUPLE[k][j]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-14, "columns {i},{j}: {dot}");
            }
        }
    }

    #[test]
    fn gray_image_has_only_luminance() {
        let gray = ArrayD::from_elem(IxDyn(&[1, 3, 2, 2]), 0.4);
        let d = decouple(&gray);
        for v in d.index_axis(Axis(1), 0).iter() {
            assert!((v - 0.4 * 3f64.sqrt()).abs() < 1e-12);
        }
        for c in 1..3 {
            assert!(d.index_axis(Axis(1), c).iter().all(|v| v.abs() < 1e-12));
        }
    }

    #[test]
    fn inpainting_keeps_observed_region_with_denoising() {
        // VE marginal mean is x0, so with denoise the observed entries come back exactly.
        let sde = VeSde::new(0.01, 10.0, 20).unwrap();
        let cfg = PcSamplerConfig {
            corrector: Corrector::None,
            ..PcSamplerConfig::default()
        };
        let inpainter = PcInpainter::new(sde, cfg).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let data = batch::randn(&[2, 1, 3, 3], &mut rng);
        let mut mask = ArrayD::zeros(IxDyn(&[2, 1, 3, 3]));
        mask.index_axis_mut(Axis(2), 0).fill(1.0);

        let (out, nfe) = inpainter.inpaint(&zero_model, &data, &mask, 7).unwrap();
        assert_eq!(nfe, 40);
        for ((o, d), m) in out.iter().zip(data.iter()).zip(mask.iter()) {
            if *m == 1.0 {
                assert_eq!(o, d);
            }
        }
    }

    #[test]
    fn inpainting_rejects_mask_shape_mismatch() {
        let sde = VpSde::new(0.1, 20.0, 100).unwrap();
        let inpainter = PcInpainter::new(sde, PcSamplerConfig::default()).unwrap();
        let data = ArrayD::zeros(IxDyn(&[1, 4]));
        let mask = ArrayD::zeros(IxDyn(&[1, 5]));
        assert!(matches!(
            inpainter.inpaint(&zero_model, &data, &mask, 0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn colorizer_requires_three_channels() {
        let sde = VpSde::new(0.1, 20.0, 100).unwrap();
        let colorizer = PcColorizer::new(sde, PcSamplerConfig::default()).unwrap();
        let gray = ArrayD::zeros(IxDyn(&[1, 1, 2, 2]));
        assert!(matches!(
            colorizer.colorize(&zero_model, &gray, 0),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn colorization_preserves_luminance_with_denoising() {
        let sde = VeSde::new(0.01, 10.0, 15).unwrap();
        let colorizer = PcColorizer::new(sde, PcSamplerConfig::default()).unwrap();
        let gray = ArrayD::from_elem(IxDyn(&[1, 3, 2, 2]), 0.25);
        let (out, _) = colorizer.colorize(&zero_model, &gray, 5).unwrap();
        let lum_out = decouple(&out);
        let lum_in = decouple(&gray);
        for (a, b) in lum_out
            .index_axis(Axis(1), 0)
            .iter()
            .zip(lum_in.index_axis(Axis(1), 0).iter())
        {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
