use skysep_core::common::constants::UNSEEN;
use skysep_core::numerics::{identity, matmul, max_abs_difference};
use skysep_core::separation::ParameterCovariance;
use skysep_core::separation::resolution::regrade;
use skysep_core::sky::ud_grade;
use skysep_core::{
    Cmb, Instrument, InstrumentRecord, LevenbergMarquardtSolver, MapStack, MixingMatrix, PatchIds,
    PowerLaw, basic_comp_sep, ilc,
};
use tracing_subscriber::EnvFilter;

const FREQUENCIES: [f64; 4] = [40.0, 70.0, 100.0, 140.0];
const N_PIX: usize = 48;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("skysep_core=debug"))
        .with_test_writer()
        .try_init();
}

fn instrument(frequencies: &[f64]) -> Instrument {
    Instrument::Record(InstrumentRecord::new(frequencies.to_vec()))
}

fn cmb_map(pixel: usize) -> f64 {
    (pixel as f64 * 0.83).sin() * 3.0
}

fn synchrotron_map(pixel: usize) -> f64 {
    12.0 + (pixel as f64 * 0.29).cos() * 4.0
}

fn synthetic_sky(frequencies: &[f64], beta: f64, noise: f64) -> MapStack {
    let mut values = Vec::with_capacity(frequencies.len() * N_PIX);
    for (f, &frequency) in frequencies.iter().enumerate() {
        for pixel in 0..N_PIX {
            let seed = ((f * N_PIX + pixel) * 2654435761) % 10007;
            let jitter = noise * (seed as f64 / 10007.0 - 0.5);
            values.push(
                cmb_map(pixel) + synchrotron_map(pixel) * (frequency / 40.0).powf(beta) + jitter,
            );
        }
    }
    MapStack::new(frequencies.len(), 1, N_PIX, values).expect("synthetic sky")
}

fn fitted_model() -> MixingMatrix {
    MixingMatrix::new(vec![Box::new(Cmb), Box::new(PowerLaw::new(40.0, -2.5))])
}

fn fixed_model() -> MixingMatrix {
    MixingMatrix::new(vec![Box::new(Cmb), Box::new(PowerLaw::fixed(40.0, -3.0))])
}

fn assert_close(label: &str, expected: f64, actual: f64, abs_tol: f64) {
    assert!(
        (expected - actual).abs() <= abs_tol,
        "{label}: expected {expected}, got {actual} (tolerance {abs_tol})"
    );
}

#[test]
fn masking_one_pixel_only_changes_that_pixel() {
    init_logging();
    let data = synthetic_sky(&FREQUENCIES, -3.0, 0.0);
    let solver = LevenbergMarquardtSolver::default();
    let reference =
        basic_comp_sep(&fitted_model(), &instrument(&FREQUENCIES), &data, 0, &solver).expect("fit");

    let masked_pixel = 17;
    let masked = data.with_pixels_set(|pixel| pixel == masked_pixel, UNSEEN);
    let result =
        basic_comp_sep(&fitted_model(), &instrument(&FREQUENCIES), &masked, 0, &solver).expect("fit");

    assert!(!result.mask_good.is_valid(masked_pixel));
    assert_close("beta", reference.x[0][0], result.x[0][0], 1.0e-6);
    for comp in 0..2 {
        for pixel in 0..N_PIX {
            let actual = result.s.get(comp, 0, pixel);
            if pixel == masked_pixel {
                assert_eq!(actual, UNSEEN);
            } else {
                let label = format!("component {comp}, pixel {pixel}");
                assert_close(&label, reference.s.get(comp, 0, pixel), actual, 1.0e-5);
            }
        }
    }
    assert_eq!(result.chi.get(2, 0, masked_pixel), UNSEEN);
}

#[test]
fn zero_parameter_fit_matches_ilc_projection() {
    let frequencies = [40.0, 140.0];
    let data = synthetic_sky(&frequencies, -3.0, 0.0);
    let fit = basic_comp_sep(
        &fixed_model(),
        &instrument(&frequencies),
        &data,
        0,
        &LevenbergMarquardtSolver::default(),
    )
    .expect("projection");
    let combination = ilc(&fixed_model(), &instrument(&frequencies), &data, None).expect("ilc");

    assert!(fit.params.is_empty());
    assert_eq!(fit.iterations, 0);
    for comp in 0..2 {
        for pixel in 0..N_PIX {
            let label = format!("component {comp}, pixel {pixel}");
            assert_close(
                &label,
                fit.s.get(comp, 0, pixel),
                combination.s.get(comp, 0, pixel),
                1.0e-8,
            );
        }
    }
}

#[test]
fn ilc_weights_are_unbiased_and_recover_the_sky() {
    let frequencies = [40.0, 100.0];
    let data = synthetic_sky(&frequencies, -3.0, 1.0e-3);
    let result = ilc(&fixed_model(), &instrument(&frequencies), &data, None).expect("ilc");

    let mixing = fixed_model().eval(&frequencies, &[]);
    assert!(max_abs_difference(&matmul(&result.w[0], &mixing), &identity(2)) < 1.0e-6);
    for pixel in 0..N_PIX {
        assert_close("cmb", cmb_map(pixel), result.s.get(0, 0, pixel), 1.0e-2);
        assert_close(
            "synchrotron",
            synchrotron_map(pixel),
            result.s.get(1, 0, pixel),
            1.0e-2,
        );
    }
}

#[test]
fn rank_deficient_patch_raises_numerical_error() {
    init_logging();
    let map: Vec<f64> = (0..N_PIX).map(cmb_map).collect();
    let data = MapStack::from_channels(&[map.clone(), map.clone(), map.clone(), map])
        .expect("identical channels");
    let cmb_only = MixingMatrix::new(vec![Box::new(Cmb)]);
    let patches = PatchIds::PerPixel((0..N_PIX).map(|pixel| pixel / 24).collect());

    let error =
        ilc(&cmb_only, &instrument(&FREQUENCIES), &data, Some(&patches)).expect_err("singular");
    assert!(error.is_numerical());
    assert_eq!(error.code(), "NUMERIC.SINGULAR_COVARIANCE");
    assert!(error.diagnostic_line().starts_with("ERROR: [NUMERIC.SINGULAR_COVARIANCE]"));
}

#[test]
fn splitting_into_patches_preserves_fit_and_layout() {
    let data = synthetic_sky(&FREQUENCIES, -3.0, 0.0);
    let solver = LevenbergMarquardtSolver::default();
    let global =
        basic_comp_sep(&fitted_model(), &instrument(&FREQUENCIES), &data, 0, &solver).expect("fit");
    let patched =
        basic_comp_sep(&fitted_model(), &instrument(&FREQUENCIES), &data, 1, &solver).expect("fit");

    assert_eq!(patched.x[0].len(), 12);
    for beta in &patched.x[0] {
        assert_close("patch beta", global.x[0][0], *beta, 1.0e-6);
    }
    assert_eq!(patched.s.channels(), global.s.channels());
    assert_eq!(patched.s.n_pix(), global.s.n_pix());
    assert_eq!(patched.s.ordering(), global.s.ordering());

    let (ParameterCovariance::Maps(global_sigma), ParameterCovariance::Maps(patch_sigma)) =
        (&global.sigma, &patched.sigma)
    else {
        panic!("per-patch covariance expected");
    };
    assert_eq!(patch_sigma.len(), 1);
    assert_eq!(patch_sigma[0][0].len(), 12);
    assert!(patch_sigma[0][0].iter().all(|&value| value.is_finite() && value > 0.0));
    // Pixels enter the Fisher information independently, so it adds up over patches.
    let global_information = 1.0 / global_sigma[0][0][0];
    let patch_information: f64 = patch_sigma[0][0].iter().map(|value| 1.0 / value).sum();
    assert_close(
        "beta information",
        global_information,
        patch_information,
        1.0e-3 * global_information,
    );
    for pixel in 0..N_PIX {
        assert_close(
            "cmb",
            global.s.get(0, 0, pixel),
            patched.s.get(0, 0, pixel),
            1.0e-5,
        );
    }
}

#[test]
fn level_zero_round_trip_is_uniform() {
    let map: Vec<f64> = (0..N_PIX).map(cmb_map).collect();
    let global = regrade(&map, 0).expect("downgrade");
    assert_eq!(global.len(), 1);
    let restored = regrade(&global, 2).expect("upgrade");
    assert_eq!(restored.len(), N_PIX);
    assert!(restored.iter().all(|&value| value == restored[0]));
}

#[test]
fn regrading_between_levels_preserves_cell_means() {
    let map: Vec<f64> = (0..192).map(|pixel| synchrotron_map(pixel) + pixel as f64).collect();
    let low = ud_grade(&map, 2, false).expect("downgrade");
    let high = ud_grade(&low, 4, false).expect("upgrade");
    for cell in 0..N_PIX {
        let original: f64 = map[cell * 4..cell * 4 + 4].iter().sum::<f64>() / 4.0;
        let restored: f64 = high[cell * 4..cell * 4 + 4].iter().sum::<f64>() / 4.0;
        assert_close("cell mean", original, restored, 1.0e-10);
    }
}
