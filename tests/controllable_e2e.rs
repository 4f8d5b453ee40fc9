use ndarray::{Array1, ArrayD, Axis, IxDyn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use scoresde::batch;
use scoresde::controllable::{decouple, PcColorizer, PcInpainter};
use scoresde::corrector::Corrector;
use scoresde::predictor::Predictor;
use scoresde::sampling::PcSamplerConfig;
use scoresde::sde::{VeSde, VpSde};

fn shrink_model(x: &ArrayD<f64>, _labels: &Array1<f64>) -> ArrayD<f64> {
    x.mapv(|v| 0.1 * v)
}

#[test]
fn vp_ancestral_inpainting_keeps_observed_pixels() {
    let sde = VpSde::new(0.1, 20.0, 200).unwrap();
    let cfg = PcSamplerConfig {
        predictor: Predictor::AncestralSampling,
        corrector: Corrector::Langevin,
        continuous: false,
        ..PcSamplerConfig::default()
    };
    let inpainter = PcInpainter::new(sde, cfg).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let data = batch::randn(&[2, 3, 4, 4], &mut rng);
    // Observe the left half of every image.
    let mut mask = ArrayD::zeros(IxDyn(&[2, 3, 4, 4]));
    for col in 0..2 {
        mask.index_axis_mut(Axis(3), col).fill(1.0);
    }

    let (out, nfe) = inpainter.inpaint(&shrink_model, &data, &mask, 1).unwrap();
    assert_eq!(out.shape(), data.shape());
    assert_eq!(nfe, 400);
    for ((o, d), m) in out.iter().zip(data.iter()).zip(mask.iter()) {
        assert!(o.is_finite());
        if *m == 1.0 {
            // Denoised output carries the VP mean at eps, e^{lmc(eps)} ≈ 1 - 5e-5.
            assert!((o - d).abs() < 1e-3 * (1.0 + d.abs()));
        }
    }
}

#[test]
fn inpainting_is_deterministic_per_seed() {
    let sde = VeSde::new(0.01, 10.0, 30).unwrap();
    let inpainter = PcInpainter::new(sde, PcSamplerConfig::default()).unwrap();
    let data = ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 0.5);
    let mut mask = ArrayD::zeros(IxDyn(&[1, 1, 3, 3]));
    mask[[0, 0, 1, 1]] = 1.0;

    let (a, _) = inpainter.inpaint(&shrink_model, &data, &mask, 4).unwrap();
    let (b, _) = inpainter.inpaint(&shrink_model, &data, &mask, 4).unwrap();
    assert_eq!(a, b);
}

#[test]
fn colorization_matches_gray_luminance() {
    let sde = VpSde::new(0.1, 20.0, 100).unwrap();
    let colorizer = PcColorizer::new(sde, PcSamplerConfig::default()).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let g = batch::randn(&[2, 1, 4, 4], &mut rng);
    let gray = ndarray::concatenate(Axis(1), &[g.view(), g.view(), g.view()]).unwrap();

    let (out, nfe) = colorizer.colorize(&shrink_model, &gray, 3).unwrap();
    assert_eq!(out.shape(), &[2, 3, 4, 4]);
    assert_eq!(nfe, 200);

    let lum_out = decouple(&out);
    let lum_in = decouple(&gray);
    for (a, b) in lum_out
        .index_axis(Axis(1), 0)
        .iter()
        .zip(lum_in.index_axis(Axis(1), 0).iter())
    {
        assert!((a - b).abs() < 1e-3 * (1.0 + b.abs()));
    }
}
