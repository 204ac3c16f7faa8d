//! End-to-end checks of the samplers through the public API: extraction
//! counts, reproducibility, interruption and shrinkage toward the raw CSMF.

use calib_va::chains::{extract_csmf, run_chains, Posterior};
use calib_va::config::{Hyperparameters, Method};
use calib_va::core::RunOptions;
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix, Source};
use calib_va::ensemble::{EnsembleData, EnsembleSampler};
use calib_va::error::CalibError;
use calib_va::gibbs::GibbsSampler;
use ndarray::Array1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn repeat(pattern: &[(&'static str, usize)]) -> Vec<&'static str> {
        pattern
            .iter()
            .flat_map(|&(label, n)| std::iter::repeat(label).take(n))
            .collect()
    }

    /// The algorithm calls half of the true "B" deaths "A".
    fn confused_data() -> CalibrationData {
        let causes = CauseSet::new(["A", "B", "C"]).unwrap();
        let unlabeled = repeat(&[("A", 60), ("B", 30), ("C", 10)]);
        let labeled = repeat(&[("A", 10), ("B", 5), ("C", 5)]);
        let gold = repeat(&[("A", 5), ("B", 10), ("C", 5)]);
        CalibrationData::new(
            causes.clone(),
            PredictionMatrix::from_labels(&unlabeled, &causes, "va_unlabeled").unwrap(),
            PredictionMatrix::from_labels(&labeled, &causes, "va_labeled").unwrap(),
            &gold,
        )
        .unwrap()
    }

    fn posterior_mean(posterior: &Posterior, burnin: usize) -> Array1<f64> {
        let draws = posterior.pooled_csmf(burnin, 1).unwrap();
        draws.values.mean_axis(ndarray::Axis(0)).unwrap()
    }

    #[test]
    fn extraction_count_matches_formula() {
        let sampler = GibbsSampler::new(confused_data(), Hyperparameters::default()).unwrap();
        let posterior = run_chains(1, 3, &sampler, 50, &RunOptions::default()).unwrap();
        let chain = &posterior.chains[0];
        for (b, t) in [(0, 1), (10, 3), (49, 1), (7, 50), (20, 7)] {
            let draws = extract_csmf(chain, &posterior.causes, b, t).unwrap();
            assert_eq!(draws.n_draws(), (50 - b - 1) / t + 1, "burnin {b}, thin {t}");
            for (k, row) in draws.values.outer_iter().enumerate() {
                assert_eq!(row, chain.p.row(b + k * t));
            }
        }
        assert!(matches!(
            extract_csmf(chain, &posterior.causes, 50, 1),
            Err(CalibError::InvalidInput { .. })
        ));
        assert!(extract_csmf(chain, &posterior.causes, 0, 0).is_err());
    }

    #[test]
    fn fixed_seed_reproduces_every_chain() {
        let sampler = GibbsSampler::new(confused_data(), Hyperparameters::default()).unwrap();
        let a = run_chains(3, 77, &sampler, 60, &RunOptions::default()).unwrap();
        let b = run_chains(3, 77, &sampler, 60, &RunOptions::default()).unwrap();
        assert_eq!(a.chains, b.chains);
    }

    #[test]
    fn raised_interrupt_aborts_the_run() {
        let sampler = GibbsSampler::new(confused_data(), Hyperparameters::default()).unwrap();
        let options = RunOptions::default().with_interrupt(Arc::new(AtomicBool::new(true)));
        let result = run_chains(2, 1, &sampler, 100, &options);
        assert!(matches!(result, Err(CalibError::Interrupted)));
    }

    #[test]
    fn larger_lambda_moves_csmf_toward_raw_prediction() {
        let data = confused_data();
        let raw = data.source().unlabeled.raw_csmf();
        let distance = |lambda: f64| {
            let hyper = Hyperparameters::default().with_method(Method::pshrink(lambda));
            let sampler = GibbsSampler::new(data.clone(), hyper).unwrap();
            let posterior = run_chains(2, 5, &sampler, 2_000, &RunOptions::default()).unwrap();
            (posterior_mean(&posterior, 500) - &raw).mapv(f64::abs).sum()
        };
        let (d1, d10, d100) = (distance(1.0), distance(10.0), distance(100.0));
        assert!(d10 < d1, "lambda 10: {d10}, lambda 1: {d1}");
        assert!(d100 < d10, "lambda 100: {d100}, lambda 10: {d10}");
    }

    /// Every target and calibration record says "A"; the gold standard is
    /// A 5, B 3, C 2.
    fn all_a_data() -> CalibrationData {
        let causes = CauseSet::new(["A", "B", "C"]).unwrap();
        let gold = repeat(&[("A", 5), ("B", 3), ("C", 2)]);
        CalibrationData::new(
            causes.clone(),
            PredictionMatrix::from_labels(&vec!["A"; 100], &causes, "va_unlabeled").unwrap(),
            PredictionMatrix::from_labels(&vec!["A"; 10], &causes, "va_labeled").unwrap(),
            &gold,
        )
        .unwrap()
    }

    #[test]
    fn larger_alpha_moves_csmf_toward_raw_prediction() {
        let data = all_a_data();
        let raw = data.source().unlabeled.raw_csmf();
        // Weak shrinkage leaves each chain in whichever corner it drifts to,
        // so the pooled mean needs many chains.
        let distance = |alpha: f64| {
            let hyper = Hyperparameters::default().with_method(Method::mshrink(alpha));
            let sampler = GibbsSampler::new(data.clone(), hyper).unwrap();
            let posterior = run_chains(16, 21, &sampler, 1_500, &RunOptions::default()).unwrap();
            (posterior_mean(&posterior, 500) - &raw).mapv(f64::abs).sum()
        };
        let alphas = [0.001, 5.0, 50.0, 500.0];
        let distances: Vec<f64> = alphas.iter().map(|&a| distance(a)).collect();
        for (pair, d) in alphas.windows(2).zip(distances.windows(2)) {
            assert!(
                d[1] <= d[0] + 0.3,
                "alpha {}: {}, alpha {}: {}",
                pair[1],
                d[1],
                pair[0],
                d[0]
            );
        }
        assert!(distances[0] > distances[3] + 0.5, "{distances:?}");
        assert!(distances[3] < 0.05, "{distances:?}");
    }

    #[test]
    fn calibration_moves_mass_from_a_to_b() {
        let sampler = GibbsSampler::new(confused_data(), Hyperparameters::default()).unwrap();
        let posterior = run_chains(2, 8, &sampler, 2_000, &RunOptions::default()).unwrap();
        let mean = posterior_mean(&posterior, 500);
        // Raw prediction is A 0.6, B 0.3.
        assert!(mean[0] < 0.6, "p_A {}", mean[0]);
        assert!(mean[1] > 0.3, "p_B {}", mean[1]);
    }

    #[test]
    fn ensemble_runs_through_the_chain_driver() {
        let data = confused_data();
        let twin = Source {
            unlabeled: data.source().unlabeled.clone(),
            labeled: data.source().labeled.clone(),
        };
        let gold: Vec<&str> = data
            .gold_standard()
            .iter()
            .map(|&g| data.causes().label(g))
            .collect();
        let ensemble = EnsembleData::new(
            data.causes().clone(),
            vec![data.source().clone(), twin],
            &gold,
        )
        .unwrap();
        let sampler = EnsembleSampler::new(ensemble, Hyperparameters::default()).unwrap();
        let posterior = run_chains(2, 1, &sampler, 100, &RunOptions::default()).unwrap();
        assert_eq!(posterior.chains[0].m.shape(), &[100, 2, 3, 3]);
        assert_eq!(posterior.chains[1].gamma.as_ref().unwrap().shape(), &[100, 2, 3]);
    }
}
