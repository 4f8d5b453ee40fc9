use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, ArrayD};

use scoresde::corrector::Corrector;
use scoresde::likelihood::{Likelihood, LikelihoodConfig};
use scoresde::ode::{AdaptiveConfig, OdeMethod, OdeSolver};
use scoresde::predictor::Predictor;
use scoresde::sampling::{OdeSampler, OdeSamplerConfig, PcSampler, PcSamplerConfig};
use scoresde::sde::{VeSde, VpSde};

/// VP networks predict the (scaled) noise, so a positive multiple of `x` pulls towards 0.
fn vp_model(x: &ArrayD<f64>, _labels: &Array1<f64>) -> ArrayD<f64> {
    x.mapv(|v| 0.5 * v)
}

/// VE networks predict the score directly.
fn ve_model(x: &ArrayD<f64>, labels: &Array1<f64>) -> ArrayD<f64> {
    let mut out = x.clone();
    for (mut item, &sigma) in out.axis_iter_mut(ndarray::Axis(0)).zip(labels.iter()) {
        item.mapv_inplace(|v| -v / (1.0 + sigma * sigma));
    }
    out
}

fn bench_pc(c: &mut Criterion) {
    let mut group = c.benchmark_group("pc_sampler");
    group.sample_size(20);

    let cases = [
        ("reverse_diffusion+langevin", Predictor::ReverseDiffusion, Corrector::Langevin),
        ("euler_maruyama+none", Predictor::EulerMaruyama, Corrector::None),
        ("ancestral+annealed", Predictor::AncestralSampling, Corrector::AnnealedLangevin),
    ];

    for &(name, predictor, corrector) in &cases {
        for &(b, d) in &[(16usize, 8usize), (4usize, 256usize)] {
            let sde = VpSde::new(0.1, 20.0, 100).unwrap();
            let cfg = PcSamplerConfig {
                predictor,
                corrector,
                ..PcSamplerConfig::default()
            };
            let sampler = PcSampler::new(sde, &[b, d], cfg).unwrap();
            group.bench_with_input(BenchmarkId::new(name, format!("b{b}_d{d}")), &sampler, |bch, s| {
                bch.iter(|| s.sample(&vp_model, None, 0).unwrap())
            });
        }
    }
    group.finish();
}

fn bench_ode(c: &mut Criterion) {
    let mut group = c.benchmark_group("probability_flow");
    group.sample_size(20);

    let solvers = [
        ("heun_50", OdeSolver::Fixed { method: OdeMethod::Heun, steps: 50 }),
        ("dopri5_1e-5", OdeSolver::Dopri5(AdaptiveConfig::default())),
    ];

    for &(name, solver) in &solvers {
        let sde = VeSde::new(0.01, 10.0, 1000).unwrap();
        let sampler = OdeSampler::new(
            sde.clone(),
            &[16, 8],
            OdeSamplerConfig {
                solver,
                ..OdeSamplerConfig::default()
            },
        )
        .unwrap();
        group.bench_function(BenchmarkId::new("sample", name), |bch| {
            bch.iter(|| sampler.sample(&ve_model, None, 0).unwrap())
        });

        let lik = Likelihood::new(
            sde,
            LikelihoodConfig {
                solver,
                ..LikelihoodConfig::default()
            },
        )
        .unwrap();
        let data = ArrayD::from_elem(ndarray::IxDyn(&[16, 8]), 0.25);
        group.bench_function(BenchmarkId::new("bits_per_dim", name), |bch| {
            bch.iter(|| lik.bits_per_dim(&ve_model, &data, 0).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pc, bench_ode);
criterion_main!(benches);
