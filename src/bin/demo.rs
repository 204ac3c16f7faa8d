//! Simulates an algorithm that confuses causes, calibrates its target-set
//! predictions against a small gold-standard set, and prints the CSMF summary.

use calib_va::chains::{extract_csmf, run_chains};
use calib_va::config::{Hyperparameters, Method};
use calib_va::core::RunOptions;
use calib_va::csmf::summarize;
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};
use calib_va::distributions::{Categorical, DiscreteDistribution};
use calib_va::gibbs::{CalibrationSampler, GibbsSampler};
use calib_va::tuning::{tune, TuneConfig, TuneInput};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::error::Error;

const CAUSES: [&str; 4] = ["cardio", "infection", "injury", "other"];
const TRUE_CSMF: [f64; 4] = [0.45, 0.30, 0.15, 0.10];
/// Row `i`: how the simulated algorithm labels a death whose true cause is `i`.
const CONFUSION: [[f64; 4]; 4] = [
    [0.70, 0.10, 0.05, 0.15],
    [0.25, 0.60, 0.05, 0.10],
    [0.05, 0.05, 0.85, 0.05],
    [0.30, 0.20, 0.05, 0.45],
];
const N_LABELED: usize = 200;
const N_UNLABELED: usize = 1_000;
const SEED: u64 = 42;

fn draw(probs: &[f64], rng: &mut SmallRng) -> usize {
    let log_w: Vec<f64> = probs.iter().map(|p| p.ln()).collect();
    Categorical::from_log_weights(&log_w).sample(rng)
}

/// `(true cause, predicted cause)` labels for `n` simulated deaths.
fn simulate(n: usize, csmf: &[f64], rng: &mut SmallRng) -> (Vec<&'static str>, Vec<&'static str>) {
    (0..n)
        .map(|_| {
            let truth = draw(csmf, rng);
            (CAUSES[truth], CAUSES[draw(&CONFUSION[truth], rng)])
        })
        .unzip()
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let mut rng = SmallRng::seed_from_u64(SEED);

    let causes = CauseSet::new(CAUSES)?;
    let (gold, labeled) = simulate(N_LABELED, &[0.25; 4], &mut rng);
    let (_, unlabeled) = simulate(N_UNLABELED, &TRUE_CSMF, &mut rng);
    let unlabeled = PredictionMatrix::from_labels(&unlabeled, &causes, "va_unlabeled")?;
    let labeled = PredictionMatrix::from_labels(&labeled, &causes, "va_labeled")?;
    let raw = unlabeled.raw_csmf();
    let data = CalibrationData::new(causes, unlabeled, labeled, &gold)?;

    let hyper = Hyperparameters::default().with_method(Method::pshrink(1.0));
    let sampler = GibbsSampler::new(data, hyper)?;
    let config = TuneConfig::default()
        .with_chains(2)
        .with_draws(2_000, 500, 5)
        .with_seed(SEED)
        .with_options(RunOptions::default().with_progress(true));
    let result = tune(&sampler, TuneInput::Grid(vec![0.1, 1.0, 10.0, 100.0]), &config)?;

    println!("lambda      WAIC   max R-hat");
    for c in &result.table {
        println!("{:>6} {:>9.2} {:>11.3}", c.value, c.waic.waic, c.max_rhat);
    }
    println!("uncalibrated WAIC: {:.2}", result.baseline.waic);
    println!("selected lambda: {}", result.best_value);

    let draws = result.best_model.pooled_csmf(config.burnin, config.thin)?;
    println!("\ncause        true    raw     mean   [2.5%, 97.5%]");
    for (i, s) in summarize(&draws)?.iter().enumerate() {
        println!(
            "{:<10} {:>6.3} {:>6.3} {:>8.3}   [{:.3}, {:.3}]",
            s.cause, TRUE_CSMF[i], raw[i], s.mean, s.lower, s.upper
        );
    }

    // A single mshrink chain for comparison.
    let mshrink = sampler.with_method(Method::mshrink(5.0))?;
    let posterior = run_chains(1, SEED, &mshrink, 2_000, &RunOptions::default())?;
    let draws = extract_csmf(&posterior.chains[0], &posterior.causes, 500, 5)?;
    let means: Vec<String> = summarize(&draws)?
        .iter()
        .map(|s| format!("{}={:.3}", s.cause, s.mean))
        .collect();
    println!("\nmshrink (alpha = 5): {}", means.join(", "));
    Ok(())
}

#[test]
fn test_main() {
    main().expect("Expected main to not return an error.");
}
