//! ODE integrators for the probability-flow paths.
//!
//! Both sampling and likelihood evaluation integrate
//! \[
//! \frac{dy}{dt} = F(y, t)
//! \]
//! on a flat state vector. Two families are provided:
//!
//! - fixed-step Euler / Heun ([`integrate_fixed`]): deterministic cost, no hidden tolerances
//! - Dormand-Prince 5(4) ([`integrate_dopri5`]): adaptive, error-controlled, FSAL
//!
//! Every solve reports the number of right-hand-side evaluations (`nfe`), which is the cost
//! measure samplers and the likelihood engine report back to callers. Non-finite derivatives,
//! step-size underflow and an exhausted step budget are errors, never silent garbage.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use tracing::{trace, warn};

/// Fixed-step ODE method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OdeMethod {
    /// Explicit Euler (1st order).
    Euler,
    /// Heun / explicit trapezoid / RK2 (2nd order).
    Heun,
}

/// Result of an integration.
#[derive(Debug, Clone)]
pub struct OdeSolution {
    /// State at the final time.
    pub y: Array1<f64>,
    /// Final time reached.
    pub t: f64,
    /// Right-hand-side evaluations.
    pub nfe: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Counts evaluations and rejects non-finite or wrongly sized derivatives.
struct Rhs<F> {
    f: F,
    nfe: usize,
}

impl<F> Rhs<F>
where
    F: FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
{
    fn eval(&mut self, y: &Array1<f64>, t: f64) -> Result<Array1<f64>> {
        self.nfe += 1;
        let v = (self.f)(&y.view(), t)?;
        if v.len() != y.len() {
            return Err(Error::ShapeMismatch {
                what: "ode derivative",
                expected: vec![y.len()],
                got: vec![v.len()],
            });
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::NumericalInstability {
                t,
                msg: "non-finite derivative",
            });
        }
        Ok(v)
    }
}

/// Integrate with fixed steps on a vector state.
///
/// - `x0`: initial state
/// - `t0`: initial time
/// - `dt`: step size (may be negative to integrate backwards)
/// - `steps`: number of steps (must be >= 1)
/// - `f`: returns \(F(y,t)\)
pub fn integrate_fixed(
    method: OdeMethod,
    x0: &Array1<f64>,
    t0: f64,
    dt: f64,
    steps: usize,
    f: impl FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
) -> Result<OdeSolution> {
    if steps == 0 {
        return Err(Error::Configuration("fixed-step solver needs steps >= 1"));
    }
    if !dt.is_finite() {
        return Err(Error::Configuration("step size must be finite"));
    }

    let mut rhs = Rhs { f, nfe: 0 };
    let mut x = x0.clone();
    let mut t = t0;

    match method {
        OdeMethod::Euler => {
            for _ in 0..steps {
                let v = rhs.eval(&x, t)?;
                x.scaled_add(dt, &v);
                t += dt;
            }
        }
        OdeMethod::Heun => {
            for _ in 0..steps {
                let v0 = rhs.eval(&x, t)?;

                // predictor
                let mut x_pred = x.clone();
                x_pred.scaled_add(dt, &v0);

                // corrector
                let v1 = rhs.eval(&x_pred, t + dt)?;
                x.scaled_add(0.5 * dt, &(v0 + &v1));

                t += dt;
            }
        }
    }

    Ok(OdeSolution {
        y: x,
        t,
        nfe: rhs.nfe,
        accepted: steps,
        rejected: 0,
    })
}

/// Tolerances and budget for [`integrate_dopri5`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveConfig {
    pub rtol: f64,
    pub atol: f64,
    /// Maximum number of attempted steps (accepted + rejected).
    pub max_steps: usize,
    /// Initial step magnitude; chosen automatically when `None`.
    pub first_step: Option<f64>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-5,
            max_steps: 100_000,
            first_step: None,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.rtol > 0.0) || !(self.atol > 0.0) || !self.rtol.is_finite() || !self.atol.is_finite() {
            return Err(Error::Configuration("rtol and atol must be positive and finite"));
        }
        if self.max_steps == 0 {
            return Err(Error::Configuration("max_steps must be >= 1"));
        }
        if let Some(h) = self.first_step {
            if !(h > 0.0) || !h.is_finite() {
                return Err(Error::Configuration("first_step must be positive and finite"));
            }
        }
        Ok(())
    }
}

// Dormand-Prince 5(4) tableau.
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 5th minus 4th order weights.
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
/// Exponent `-1/(q+1)` with `q = 4`, the order of the embedded error estimate.
const ERROR_EXPONENT: f64 = -0.2;

/// Root-mean-square of `v / scale`.
fn rms_scaled(v: &Array1<f64>, scale: &Array1<f64>) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let s: f64 = v.iter().zip(scale.iter()).map(|(a, b)| (a / b) * (a / b)).sum();
    (s / v.len() as f64).sqrt()
}

/// One Dormand-Prince attempt: `(y_new, error, k7)` where `k7 = F(y_new, t + h)` (FSAL).
fn dopri5_step<F>(
    rhs: &mut Rhs<F>,
    y: &Array1<f64>,
    k1: &Array1<f64>,
    t: f64,
    h: f64,
) -> Result<(Array1<f64>, Array1<f64>, Array1<f64>)>
where
    F: FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
{
    let y2 = y + &(k1 * (h * A21));
    let k2 = rhs.eval(&y2, t + C2 * h)?;

    let y3 = y + &(k1 * (h * A31)) + &(&k2 * (h * A32));
    let k3 = rhs.eval(&y3, t + C3 * h)?;

    let y4 = y + &(k1 * (h * A41)) + &(&k2 * (h * A42)) + &(&k3 * (h * A43));
    let k4 = rhs.eval(&y4, t + C4 * h)?;

    let y5 = y + &(k1 * (h * A51)) + &(&k2 * (h * A52)) + &(&k3 * (h * A53)) + &(&k4 * (h * A54));
    let k5 = rhs.eval(&y5, t + C5 * h)?;

    let y6 = y
        + &(k1 * (h * A61))
        + &(&k2 * (h * A62))
        + &(&k3 * (h * A63))
        + &(&k4 * (h * A64))
        + &(&k5 * (h * A65));
    let k6 = rhs.eval(&y6, t + h)?;

    let y_new = y
        + &(k1 * (h * B1))
        + &(&k3 * (h * B3))
        + &(&k4 * (h * B4))
        + &(&k5 * (h * B5))
        + &(&k6 * (h * B6));
    let k7 = rhs.eval(&y_new, t + h)?;

    let err = k1 * (h * E1)
        + &(&k3 * (h * E3))
        + &(&k4 * (h * E4))
        + &(&k5 * (h * E5))
        + &(&k6 * (h * E6))
        + &(&k7 * (h * E7));

    Ok((y_new, err, k7))
}

/// Initial step magnitude (Hairer, Nørsett & Wanner, *Solving ODEs I*, II.4).
fn initial_step<F>(
    rhs: &mut Rhs<F>,
    t0: f64,
    y0: &Array1<f64>,
    f0: &Array1<f64>,
    direction: f64,
    span: f64,
    cfg: &AdaptiveConfig,
) -> Result<f64>
where
    F: FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
{
    if y0.is_empty() {
        return Ok(span);
    }
    let scale = y0.mapv(|v| cfg.atol + v.abs() * cfg.rtol);
    let d0 = rms_scaled(y0, &scale);
    let d1 = rms_scaled(f0, &scale);
    let h0: f64 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };
    let h0 = h0.min(span);

    let y1 = y0 + &(f0 * (direction * h0));
    let f1 = rhs.eval(&y1, t0 + direction * h0)?;
    let d2 = rms_scaled(&(f1 - f0), &scale) / h0;

    let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(-ERROR_EXPONENT)
    };
    Ok((100.0 * h0).min(h1).min(span))
}

/// Integrate from `t0` to `t1` (either direction) with Dormand-Prince 5(4).
///
/// Error control uses the mixed norm `atol + rtol * max(|y|, |y_new|)`. After a rejected
/// step the next accepted step may not grow.
pub fn integrate_dopri5(
    x0: &Array1<f64>,
    t0: f64,
    t1: f64,
    cfg: &AdaptiveConfig,
    f: impl FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
) -> Result<OdeSolution> {
    cfg.validate()?;
    if !t0.is_finite() || !t1.is_finite() {
        return Err(Error::Configuration("integration bounds must be finite"));
    }
    let mut rhs = Rhs { f, nfe: 0 };
    let span = (t1 - t0).abs();
    if span == 0.0 {
        return Ok(OdeSolution {
            y: x0.clone(),
            t: t0,
            nfe: 0,
            accepted: 0,
            rejected: 0,
        });
    }
    let direction = (t1 - t0).signum();

    let mut t = t0;
    let mut y = x0.clone();
    let mut k1 = rhs.eval(&y, t)?;
    let mut h = match cfg.first_step {
        Some(h) => h.min(span),
        None => initial_step(&mut rhs, t, &y, &k1, direction, span, cfg)?,
    };

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut after_rejection = false;

    while direction * (t1 - t) > 0.0 {
        if accepted + rejected >= cfg.max_steps {
            warn!(t, accepted, rejected, "dopri5 step budget exhausted");
            return Err(Error::NumericalInstability {
                t,
                msg: "step budget exhausted",
            });
        }
        let min_step = 10.0 * f64::EPSILON * t.abs().max(f64::EPSILON);
        if !(h >= min_step) {
            return Err(Error::NumericalInstability {
                t,
                msg: "step size underflow",
            });
        }

        let remaining = (t1 - t).abs();
        let last = h >= remaining;
        let h_try = if last { remaining } else { h };

        let (y_new, err_vec, k7) = dopri5_step(&mut rhs, &y, &k1, t, direction * h_try)?;
        let scale = Array1::from_iter(
            y.iter()
                .zip(y_new.iter())
                .map(|(a, b)| cfg.atol + cfg.rtol * a.abs().max(b.abs())),
        );
        let err = rms_scaled(&err_vec, &scale);

        if err <= 1.0 {
            t = if last { t1 } else { t + direction * h_try };
            y = y_new;
            k1 = k7;
            accepted += 1;

            let mut factor = if err == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * err.powf(ERROR_EXPONENT)).min(MAX_FACTOR)
            };
            if after_rejection {
                factor = factor.min(1.0);
            }
            h = h_try * factor;
            after_rejection = false;
            trace!(t, h, err, "dopri5 accepted");
        } else {
            h = h_try * (SAFETY * err.powf(ERROR_EXPONENT)).max(MIN_FACTOR);
            rejected += 1;
            after_rejection = true;
            trace!(t, h, err, "dopri5 rejected");
        }
    }

    if rejected > accepted {
        warn!(accepted, rejected, "dopri5 rejected more steps than it accepted");
    }

    Ok(OdeSolution {
        y,
        t,
        nfe: rhs.nfe,
        accepted,
        rejected,
    })
}

/// Solver selection for the probability-flow paths.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OdeSolver {
    /// `steps` equal steps across the interval.
    Fixed { method: OdeMethod, steps: usize },
    /// Adaptive Dormand-Prince 5(4).
    Dopri5(AdaptiveConfig),
}

impl Default for OdeSolver {
    fn default() -> Self {
        OdeSolver::Dopri5(AdaptiveConfig::default())
    }
}

impl OdeSolver {
    pub fn validate(&self) -> Result<()> {
        match self {
            OdeSolver::Fixed { steps, .. } => {
                if *steps == 0 {
                    return Err(Error::Configuration("fixed-step solver needs steps >= 1"));
                }
                Ok(())
            }
            OdeSolver::Dopri5(cfg) => cfg.validate(),
        }
    }

    /// Integrate from `t0` to `t1`.
    pub fn solve(
        &self,
        x0: &Array1<f64>,
        t0: f64,
        t1: f64,
        f: impl FnMut(&ArrayView1<f64>, f64) -> Result<Array1<f64>>,
    ) -> Result<OdeSolution> {
        match *self {
            OdeSolver::Fixed { method, steps } => {
                let dt = (t1 - t0) / steps.max(1) as f64;
                let mut sol = integrate_fixed(method, x0, t0, dt, steps, f)?;
                // Land exactly on t1 regardless of accumulated rounding.
                sol.t = t1;
                Ok(sol)
            }
            OdeSolver::Dopri5(ref cfg) => integrate_dopri5(x0, t0, t1, cfg, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decay(x: &ArrayView1<f64>, _t: f64) -> Result<Array1<f64>> {
        Ok(x.mapv(|v| -v))
    }

    #[test]
    fn heun_is_more_accurate_than_euler_on_dx_dt_eq_minus_x() {
        // ODE: dx/dt = -x, x(0)=1, exact x(1)=e^-1.
        let x0 = Array1::from_vec(vec![1.0]);
        let exact = (-1.0f64).exp();

        let steps = 20usize;
        let dt = 1.0 / (steps as f64);

        let euler = integrate_fixed(OdeMethod::Euler, &x0, 0.0, dt, steps, decay).unwrap();
        let heun = integrate_fixed(OdeMethod::Heun, &x0, 0.0, dt, steps, decay).unwrap();

        let err_euler = (euler.y[0] - exact).abs();
        let err_heun = (heun.y[0] - exact).abs();

        assert!(
            err_heun < err_euler,
            "expected Heun to be more accurate: err_heun={err_heun} err_euler={err_euler}"
        );
        assert_eq!(euler.nfe, steps);
        assert_eq!(heun.nfe, 2 * steps);
    }

    #[test]
    fn dopri5_matches_exponential_decay_in_both_directions() {
        let cfg = AdaptiveConfig::default();
        let x0 = Array1::from_vec(vec![1.0, -2.0]);

        let fwd = integrate_dopri5(&x0, 0.0, 1.0, &cfg, decay).unwrap();
        let e = (-1.0f64).exp();
        assert!((fwd.y[0] - e).abs() < 1e-5);
        assert!((fwd.y[1] + 2.0 * e).abs() < 1e-5);
        assert_eq!(fwd.t, 1.0);

        let back = integrate_dopri5(&fwd.y, 1.0, 0.0, &cfg, decay).unwrap();
        assert!((back.y[0] - 1.0).abs() < 1e-4);
        assert!((back.y[1] + 2.0).abs() < 1e-4);
    }

    #[test]
    fn dopri5_nfe_accounts_for_every_attempt() {
        let cfg = AdaptiveConfig {
            rtol: 1e-8,
            atol: 1e-8,
            ..AdaptiveConfig::default()
        };
        let x0 = Array1::from_vec(vec![1.0]);
        let sol = integrate_dopri5(&x0, 0.0, 3.0, &cfg, |x, t| {
            Ok(Array1::from_vec(vec![x[0] * (5.0 * t).cos()]))
        })
        .unwrap();
        // One initial evaluation, one for step selection, six per attempt (FSAL).
        assert_eq!(sol.nfe, 2 + 6 * (sol.accepted + sol.rejected));
        let exact = ((15.0f64).sin() / 5.0).exp();
        assert!((sol.y[0] - exact).abs() < 1e-5 * exact.max(1.0));
    }

    #[test]
    fn non_finite_derivative_is_an_error() {
        let x0 = Array1::from_vec(vec![1.0]);
        let err = integrate_dopri5(&x0, 0.0, 1.0, &AdaptiveConfig::default(), |_x, _t| {
            Ok(Array1::from_vec(vec![f64::NAN]))
        });
        assert!(matches!(err, Err(Error::NumericalInstability { .. })));

        let err = integrate_fixed(OdeMethod::Euler, &x0, 0.0, 0.1, 10, |_x, _t| {
            Ok(Array1::from_vec(vec![f64::INFINITY]))
        });
        assert!(matches!(err, Err(Error::NumericalInstability { .. })));
    }

    #[test]
    fn exhausted_budget_is_an_error() {
        let cfg = AdaptiveConfig {
            rtol: 1e-12,
            atol: 1e-12,
            max_steps: 3,
            first_step: None,
        };
        let x0 = Array1::from_vec(vec![1.0]);
        let err = integrate_dopri5(&x0, 0.0, 10.0, &cfg, |x, t| {
            Ok(Array1::from_vec(vec![x[0] * (20.0 * t).sin()]))
        });
        assert!(matches!(err, Err(Error::NumericalInstability { .. })));
    }

    #[test]
    fn invalid_solver_configs_are_rejected() {
        assert!(OdeSolver::Fixed { method: OdeMethod::Euler, steps: 0 }.validate().is_err());
        let bad = AdaptiveConfig { rtol: 0.0, ..AdaptiveConfig::default() };
        assert!(OdeSolver::Dopri5(bad).validate().is_err());
        assert!(OdeSolver::default().validate().is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_constant_field_is_exact_for_euler_and_heun(
            len in 1usize..16,
            steps in 1usize..200,
            dt in 1e-3f64..1.0f64,
            t0 in -2.0f64..2.0f64,
            x0 in prop::collection::vec(-10.0f64..10.0f64, 16),
            c in prop::collection::vec(-10.0f64..10.0f64, 16),
        ) {
            let x0 = Array1::from_vec(x0[..len].to_vec());
            let c = Array1::from_vec(c[..len].to_vec());

            let mut expected = x0.clone();
            expected.scaled_add(dt * steps as f64, &c);

            let euler = integrate_fixed(OdeMethod::Euler, &x0, t0, dt, steps, |_x, _t| Ok(c.clone())).unwrap();
            let heun = integrate_fixed(OdeMethod::Heun, &x0, t0, dt, steps, |_x, _t| Ok(c.clone())).unwrap();

            for i in 0..len {
                let tol = 1e-9 + 1e-12 * expected[i].abs();
                prop_assert!((euler.y[i] - expected[i]).abs() <= tol, "euler mismatch at {i}");
                prop_assert!((heun.y[i] - expected[i]).abs() <= tol, "heun mismatch at {i}");
            }
        }

        #[test]
        fn prop_error_decreases_with_more_steps_for_dx_dt_eq_minus_x(
            steps in 5usize..80,
        ) {
            let x0 = Array1::from_vec(vec![1.0]);
            let exact = (-1.0f64).exp();

            let dt1 = 1.0 / (steps as f64);
            let dt2 = 1.0 / ((2 * steps) as f64);

            let e1 = integrate_fixed(OdeMethod::Euler, &x0, 0.0, dt1, steps, decay).unwrap();
            let e2 = integrate_fixed(OdeMethod::Euler, &x0, 0.0, dt2, 2 * steps, decay).unwrap();
            let h1 = integrate_fixed(OdeMethod::Heun, &x0, 0.0, dt1, steps, decay).unwrap();
            let h2 = integrate_fixed(OdeMethod::Heun, &x0, 0.0, dt2, 2 * steps, decay).unwrap();

            let err_e1 = (e1.y[0] - exact).abs();
            let err_e2 = (e2.y[0] - exact).abs();
            let err_h1 = (h1.y[0] - exact).abs();
            let err_h2 = (h2.y[0] - exact).abs();

            prop_assert!(err_e2 <= err_e1 + 1e-12, "euler error did not decrease: {err_e1} -> {err_e2}");
            prop_assert!(err_h2 <= err_h1 + 1e-12, "heun error did not decrease: {err_h1} -> {err_h2}");
            prop_assert!(err_h1 <= err_e1 + 1e-12, "expected Heun <= Euler at steps={steps}");
        }

        #[test]
        fn prop_dopri5_linear_system_within_tolerance(
            rate in -3.0f64..3.0,
            x in -5.0f64..5.0,
            t1 in 0.1f64..2.0,
        ) {
            let cfg = AdaptiveConfig::default();
            let sol = integrate_dopri5(&Array1::from_vec(vec![x]), 0.0, t1, &cfg, |y, _t| {
                Ok(y.mapv(|v| rate * v))
            }).unwrap();
            let exact = x * (rate * t1).exp();
            prop_assert!((sol.y[0] - exact).abs() <= 1e-3 * (1.0 + exact.abs()));
            prop_assert_eq!(sol.t, t1);
        }
    }
}
