/*!
# Gibbs sampler for misclassification-calibrated CSMF

One chain carries the CSMF `p`, a misclassification matrix `M` per prediction
source (`M[true, predicted]`), the per-row concentrations `gamma` under
mshrink, and a latent true cause `z_j` for each unlabeled individual. A sweep
runs three full-conditional updates in a fixed order:

1. every `z_j` from `p[r] * P(record_j | true cause r, M)`,
2. every row of `M` from its Dirichlet posterior given gold-standard and latent
   causes, followed by one Metropolis-Hastings move per `gamma_i` (mshrink),
3. `p` from its Dirichlet posterior, with anchor pseudo-counts under pshrink.

Every Dirichlet update adds strictly positive prior pseudo-counts, so rows of
`M` and `p` stay on the simplex even for causes nobody predicted.

The chain keeps its own `SmallRng`; a fixed seed reproduces a chain exactly.

```rust
use calib_va::config::{Hyperparameters, Method};
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};
use calib_va::gibbs::GibbsSampler;

let causes = CauseSet::new(["A", "B"]).unwrap();
let unlabeled = PredictionMatrix::from_labels(&["A", "B", "A"], &causes, "va_unlabeled").unwrap();
let labeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_labeled").unwrap();
let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "A"]).unwrap();

let sampler = GibbsSampler::new(data, Hyperparameters::default().with_method(Method::pshrink(1.0))).unwrap();
let chain = sampler.run(50, 42).unwrap();
assert_eq!(chain.n_draws(), 50);
```
*/

use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::chains::Chain;
use crate::config::{Hyperparameters, Method};
use crate::core::{run_chain, MarkovChain, RunOptions};
use crate::data::{CalibrationData, CauseSet, PredictionMatrix, Source};
use crate::distributions::{log_sum_exp, Categorical, Dirichlet, DiscreteDistribution, GammaPrior};
use crate::error::Result;
use crate::metropolis_hastings::{update_row_concentration, RowConcentration};

/// Full parameter state of one chain after a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepState {
    /// CSMF, length `C`.
    pub p: Array1<f64>,
    /// One `C x C` misclassification matrix per prediction source.
    pub m: Vec<Array2<f64>>,
    /// Per-source, per-row concentrations (`K x C`); mshrink only.
    pub gamma: Option<Array2<f64>>,
    /// Latent true cause index of every unlabeled individual.
    pub z: Vec<usize>,
    /// Target-set log-likelihood, marginal over `z`, at this state.
    pub log_likelihood: f64,
    /// Row-concentration moves accepted during this sweep, over all sources.
    pub gamma_accepted: usize,
}

/// The seam between a concrete sampler and the chain driver / tuner.
pub trait CalibrationSampler: Clone + Send + Sync {
    type Chain: MarkovChain<State = SweepState> + Send;

    /// Builds a chain with its own RNG seeded from `seed`.
    fn chain(&self, seed: u64) -> Self::Chain;

    fn causes(&self) -> &CauseSet;

    fn hyperparameters(&self) -> &Hyperparameters;

    fn n_sources(&self) -> usize;

    fn n_unlabeled(&self) -> usize;

    /// Same data, different shrinkage method.
    fn with_method(&self, method: Method) -> Result<Self>;

    /// Same data, with every misclassification matrix pinned to the identity.
    fn uncalibrated(&self) -> Self;

    /// `log P(records_j | p, M)` for every unlabeled individual `j`.
    fn pointwise_log_likelihood(&self, p: ArrayView1<f64>, m: &[ArrayView2<f64>]) -> Array1<f64>;
}

/// Model constants shared read-only by every chain of a sampler.
#[derive(Debug, Clone)]
pub(crate) struct ModelSpec {
    pub hyper: Hyperparameters,
    /// Raw predicted CSMF of the target set.
    pub anchor: Array1<f64>,
    pub gold_counts: Array1<f64>,
    pub n_unlabeled: usize,
    pub n_causes: usize,
    pub uncalibrated: bool,
}

impl ModelSpec {
    pub fn new(
        hyper: Hyperparameters,
        anchor: Array1<f64>,
        gold_standard: &[usize],
        n_unlabeled: usize,
    ) -> Self {
        let n_causes = anchor.len();
        let mut gold_counts = Array1::<f64>::zeros(n_causes);
        gold_standard.iter().for_each(|&g| gold_counts[g] += 1.0);
        Self {
            hyper,
            anchor,
            gold_counts,
            n_unlabeled,
            n_causes,
            uncalibrated: false,
        }
    }

    pub fn initial_gamma(&self, n_sources: usize) -> Option<Array2<f64>> {
        match &self.hyper.method {
            Method::MShrink(m) if !self.uncalibrated => Some(Array2::from_shape_fn(
                (n_sources, self.n_causes),
                |(_, i)| m.gamma_init_at(i),
            )),
            _ => None,
        }
    }

    /// Dirichlet prior of row `cause`.
    pub fn row_prior(&self, gamma: Option<f64>, cause: usize) -> Array1<f64> {
        match gamma {
            Some(g) => RowConcentration::row_prior(g, self.hyper.method.delta(), cause, self.n_causes),
            None => Array1::from_elem(self.n_causes, self.hyper.method.delta()),
        }
    }

    /// Starting matrix: the prior mean of every row, or the identity when
    /// uncalibrated.
    pub fn initial_misclassification(&self, gamma: Option<ArrayView1<f64>>) -> Array2<f64> {
        if self.uncalibrated {
            return Array2::eye(self.n_causes);
        }
        let mut m = Array2::<f64>::zeros((self.n_causes, self.n_causes));
        for (i, mut row) in m.axis_iter_mut(Axis(0)).enumerate() {
            let prior = self.row_prior(gamma.map(|g| g[i]), i);
            let total = prior.sum();
            row.assign(&(prior / total));
        }
        m
    }

    /// Starting CSMF. Uniform: starting at the raw predicted CSMF traps
    /// chains under a sparse `epsilon` prior in the corner being calibrated away from.
    pub fn initial_csmf(&self) -> Array1<f64> {
        Array1::from_elem(self.n_causes, 1.0 / self.n_causes as f64)
    }

    /// Draws every row of `M` from `Dirichlet(prior_row + counts_row)`.
    pub fn draw_misclassification<R: Rng + ?Sized>(
        &self,
        counts: &Array2<f64>,
        gamma: Option<ArrayView1<f64>>,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        if self.uncalibrated {
            return Ok(Array2::eye(self.n_causes));
        }
        let mut m = Array2::<f64>::zeros((self.n_causes, self.n_causes));
        for (i, mut row) in m.axis_iter_mut(Axis(0)).enumerate() {
            let concentration = self.row_prior(gamma.map(|g| g[i]), i) + counts.row(i);
            row.assign(&Dirichlet::new(concentration)?.sample(rng)?);
        }
        Ok(m)
    }

    /// One Metropolis-Hastings move per row concentration of one source.
    pub fn update_gamma<R: Rng + ?Sized>(
        &self,
        m: &Array2<f64>,
        mut gamma: ArrayViewMut1<f64>,
        rng: &mut R,
    ) -> usize {
        let Method::MShrink(shrink) = &self.hyper.method else {
            return 0;
        };
        let prior = GammaPrior {
            shape: shrink.alpha,
            rate: shrink.beta,
        };
        let mut accepted = 0;
        for (i, g) in gamma.iter_mut().enumerate() {
            let target = RowConcentration {
                prior,
                delta: shrink.delta,
                cause: i,
                row: m.row(i),
            };
            accepted += update_row_concentration(&target, shrink.tau_at(i), g, rng) as usize;
        }
        accepted
    }

    /// Draws `p` given the latent causes.
    pub fn draw_csmf<R: Rng + ?Sized>(&self, z: &[usize], rng: &mut R) -> Result<Array1<f64>> {
        let mut concentration = Array1::from_elem(self.n_causes, self.hyper.epsilon);
        z.iter().for_each(|&r| concentration[r] += 1.0);
        if self.hyper.labeled_in_csmf {
            concentration += &self.gold_counts;
        }
        if let (Method::PShrink(shrink), false) = (&self.hyper.method, self.uncalibrated) {
            concentration.scaled_add(shrink.lambda * self.n_unlabeled as f64, &self.anchor);
        }
        Dirichlet::new(concentration)?.sample(rng)
    }
}

/// Adds `log P(record_j | true cause r, M)` to `out[r]` for every `r`.
///
/// `ln_m` is the elementwise log of `m`, computed once per sweep.
pub(crate) fn accumulate_record_log_likelihood(
    m: ArrayView2<f64>,
    ln_m: ArrayView2<f64>,
    records: &PredictionMatrix,
    j: usize,
    out: &mut [f64],
) {
    match records.hard_label(j) {
        Some(k) => out
            .iter_mut()
            .zip(ln_m.column(k).iter())
            .for_each(|(o, l)| *o += l),
        None => {
            let lik = m.dot(&records.row(j));
            out.iter_mut()
                .zip(lik.iter())
                .for_each(|(o, l)| *o += l.ln());
        }
    }
}

/// Adds one record to row `r` of a (true, predicted) count matrix.
pub(crate) fn add_record(counts: &mut Array2<f64>, r: usize, records: &PredictionMatrix, j: usize) {
    match records.hard_label(j) {
        Some(k) => counts[[r, k]] += 1.0,
        None => counts.row_mut(r).scaled_add(1.0, &records.row(j)),
    }
}

/// (true, predicted) counts of one source from gold-standard and latent causes.
pub(crate) fn count_matrix(source: &Source, gold_standard: &[usize], z: &[usize]) -> Array2<f64> {
    let c = source.unlabeled.n_causes();
    let mut counts = Array2::<f64>::zeros((c, c));
    for (j, &g) in gold_standard.iter().enumerate() {
        add_record(&mut counts, g, &source.labeled, j);
    }
    for (j, &r) in z.iter().enumerate() {
        add_record(&mut counts, r, &source.unlabeled, j);
    }
    counts
}

/// Per-individual marginal log-likelihood over sources that share a latent cause.
pub(crate) fn pointwise_over_sources(
    p: ArrayView1<f64>,
    m: &[ArrayView2<f64>],
    records: &[&PredictionMatrix],
) -> Array1<f64> {
    let ln_p: Vec<f64> = p.iter().map(|v| v.ln()).collect();
    let ln_m: Vec<Array2<f64>> = m.iter().map(|mk| mk.mapv(f64::ln)).collect();
    let n = records[0].n_individuals();
    let mut log_w = vec![0.0; p.len()];
    Array1::from_shape_fn(n, |j| {
        log_w.copy_from_slice(&ln_p);
        for ((mk, lk), rec) in m.iter().zip(&ln_m).zip(records) {
            accumulate_record_log_likelihood(mk.view(), lk.view(), rec, j, &mut log_w);
        }
        log_sum_exp(&log_w)
    })
}

/// Resamples every latent cause given `p` and one or more sources.
pub(crate) fn resample_latent_causes<R: Rng + ?Sized>(
    p: &Array1<f64>,
    m: &[Array2<f64>],
    records: &[&PredictionMatrix],
    z: &mut [usize],
    rng: &mut R,
) {
    let ln_p: Vec<f64> = p.iter().map(|v| v.ln()).collect();
    let ln_m: Vec<Array2<f64>> = m.iter().map(|mk| mk.mapv(f64::ln)).collect();
    let mut log_w = vec![0.0; p.len()];
    for (j, zj) in z.iter_mut().enumerate() {
        log_w.copy_from_slice(&ln_p);
        for ((mk, lk), rec) in m.iter().zip(&ln_m).zip(records) {
            accumulate_record_log_likelihood(mk.view(), lk.view(), rec, j, &mut log_w);
        }
        *zj = Categorical::from_log_weights(&log_w).sample(rng);
    }
}

/// Most probable cause of every record; the chain's starting `z`.
pub(crate) fn argmax_causes(records: &PredictionMatrix) -> Vec<usize> {
    records
        .probabilities()
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Single-algorithm sampler over a [`CalibrationData`] set.
#[derive(Debug, Clone)]
pub struct GibbsSampler {
    data: Arc<CalibrationData>,
    model: Arc<ModelSpec>,
}

impl GibbsSampler {
    /// Validates `hyper` against `data`; no sweep runs on invalid input.
    pub fn new(data: CalibrationData, hyper: Hyperparameters) -> Result<Self> {
        hyper.validate(data.causes().len())?;
        let model = ModelSpec::new(
            hyper,
            data.source().unlabeled.raw_csmf(),
            data.gold_standard(),
            data.n_unlabeled(),
        );
        Ok(Self {
            data: Arc::new(data),
            model: Arc::new(model),
        })
    }

    pub fn data(&self) -> &CalibrationData {
        &self.data
    }

    /// Runs one chain of `ndraws` sweeps seeded with `seed`.
    pub fn run(&self, ndraws: usize, seed: u64) -> Result<Chain> {
        let mut chain = self.chain(seed);
        let mut out = Chain::allocate(seed, ndraws, self)?;
        run_chain(&mut chain, ndraws, &RunOptions::default(), |i, s| out.record(i, s))?;
        Ok(out)
    }
}

impl CalibrationSampler for GibbsSampler {
    type Chain = GibbsChain;

    fn chain(&self, seed: u64) -> GibbsChain {
        GibbsChain::new(self.clone(), seed)
    }

    fn causes(&self) -> &CauseSet {
        self.data.causes()
    }

    fn hyperparameters(&self) -> &Hyperparameters {
        &self.model.hyper
    }

    fn n_sources(&self) -> usize {
        1
    }

    fn n_unlabeled(&self) -> usize {
        self.data.n_unlabeled()
    }

    fn with_method(&self, method: Method) -> Result<Self> {
        let hyper = self.model.hyper.clone().with_method(method);
        hyper.validate(self.model.n_causes)?;
        let model = ModelSpec {
            hyper,
            ..(*self.model).clone()
        };
        Ok(Self {
            data: self.data.clone(),
            model: Arc::new(model),
        })
    }

    fn uncalibrated(&self) -> Self {
        let model = ModelSpec {
            uncalibrated: true,
            ..(*self.model).clone()
        };
        Self {
            data: self.data.clone(),
            model: Arc::new(model),
        }
    }

    fn pointwise_log_likelihood(&self, p: ArrayView1<f64>, m: &[ArrayView2<f64>]) -> Array1<f64> {
        pointwise_over_sources(p, m, &[&self.data.source().unlabeled])
    }
}

/// One chain of a [`GibbsSampler`].
#[derive(Debug, Clone)]
pub struct GibbsChain {
    sampler: GibbsSampler,
    state: SweepState,
    /// The chain-specific random seed.
    pub seed: u64,
    rng: SmallRng,
}

impl GibbsChain {
    pub fn new(sampler: GibbsSampler, seed: u64) -> Self {
        let model = &sampler.model;
        let gamma = model.initial_gamma(1);
        let m = model.initial_misclassification(gamma.as_ref().map(|g| g.row(0)));
        let p = model.initial_csmf();
        let z = argmax_causes(&sampler.data.source().unlabeled);
        let state = SweepState {
            p,
            m: vec![m],
            gamma,
            z,
            log_likelihood: f64::NAN,
            gamma_accepted: 0,
        };
        Self {
            sampler,
            state,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl MarkovChain for GibbsChain {
    type State = SweepState;

    fn step(&mut self) -> Result<&SweepState> {
        let data = &self.sampler.data;
        let model = &self.sampler.model;
        let source = data.source();
        let state = &mut self.state;

        resample_latent_causes(
            &state.p,
            &state.m,
            &[&source.unlabeled],
            &mut state.z,
            &mut self.rng,
        );

        let counts = count_matrix(source, data.gold_standard(), &state.z);
        state.m[0] = model.draw_misclassification(
            &counts,
            state.gamma.as_ref().map(|g| g.row(0)),
            &mut self.rng,
        )?;
        state.gamma_accepted = match state.gamma.as_mut() {
            Some(gamma) => model.update_gamma(&state.m[0], gamma.row_mut(0), &mut self.rng),
            None => 0,
        };

        state.p = model.draw_csmf(&state.z, &mut self.rng)?;

        state.log_likelihood =
            pointwise_over_sources(state.p.view(), &[state.m[0].view()], &[&source.unlabeled]).sum();
        Ok(&self.state)
    }

    fn current_state(&self) -> &SweepState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MShrink;
    use crate::data::Prediction;
    use approx::assert_abs_diff_eq;

    /// 3 causes, 100 unlabeled all predicted "A", 10 labeled predicted "A"
    /// with true causes A:5, B:3, C:2.
    fn all_a_data() -> CalibrationData {
        let causes = CauseSet::new(["A", "B", "C"]).unwrap();
        let unlabeled = PredictionMatrix::from_labels(&vec!["A"; 100], &causes, "va_unlabeled").unwrap();
        let labeled = PredictionMatrix::from_labels(&vec!["A"; 10], &causes, "va_labeled").unwrap();
        let gold = ["A", "A", "A", "A", "A", "B", "B", "B", "C", "C"];
        CalibrationData::new(causes, unlabeled, labeled, &gold).unwrap()
    }

    /// Posterior mean of `p_A`, pooled over a few seeds because the all-"A"
    /// target set gives a multimodal posterior under weak shrinkage.
    fn posterior_mean_a(alpha: f64) -> f64 {
        let hyper = Hyperparameters::default()
            .with_epsilon(1.0)
            .with_method(Method::MShrink(MShrink {
                alpha,
                ..MShrink::default()
            }));
        let sampler = GibbsSampler::new(all_a_data(), hyper).unwrap();
        let means: Vec<f64> = (0..4)
            .map(|seed| {
                let chain = sampler.run(3_000, 11 + seed).unwrap();
                chain.p.slice(ndarray::s![1_000.., 0]).mean().unwrap()
            })
            .collect();
        means.iter().sum::<f64>() / means.len() as f64
    }

    #[test]
    fn every_draw_is_on_the_simplex() {
        let hyper = Hyperparameters::default();
        let sampler = GibbsSampler::new(all_a_data(), hyper).unwrap();
        let mut chain = sampler.chain(42);
        for _ in 0..200 {
            let state = chain.step().unwrap();
            assert_abs_diff_eq!(state.p.sum(), 1.0, epsilon = 1e-9);
            for row in state.m[0].axis_iter(Axis(0)) {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
            }
            assert!(state.z.iter().all(|&z| z < 3));
            assert!(state.log_likelihood.is_finite());
            assert!(state.gamma.as_ref().unwrap().iter().all(|&g| g > 0.0));
        }
    }

    #[test]
    fn fixed_seed_reproduces_chain() {
        let sampler = GibbsSampler::new(all_a_data(), Hyperparameters::default()).unwrap();
        let a = sampler.run(100, 7).unwrap();
        let b = sampler.run(100, 7).unwrap();
        let c = sampler.run(100, 8).unwrap();
        assert_eq!(a.p, b.p);
        assert_eq!(a.m, b.m);
        assert_eq!(a.z, b.z);
        assert_eq!(a.log_likelihood, b.log_likelihood);
        assert_ne!(a.p, c.p);
    }

    #[test]
    fn misclassification_pulls_csmf_away_from_raw_prediction() {
        let weak = posterior_mean_a(0.001);
        let strong = posterior_mean_a(500.0);
        assert!(strong > weak, "strong {strong} <= weak {weak}");
        assert!(strong > 0.95, "strong shrinkage p_A {strong}");
    }

    #[test]
    fn single_calibration_individual_per_cause_stays_normalised() {
        let causes = CauseSet::new(["A", "B", "C"]).unwrap();
        let unlabeled =
            PredictionMatrix::from_labels(&["A", "B", "C", "C"], &causes, "va_unlabeled").unwrap();
        let labeled = PredictionMatrix::from_labels(&["B", "B", "C"], &causes, "va_labeled").unwrap();
        let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B", "C"]).unwrap();
        for method in [Method::mshrink(5.0), Method::pshrink(1.0)] {
            let hyper = Hyperparameters::default().with_method(method);
            let chain = GibbsSampler::new(data.clone(), hyper).unwrap().run(300, 1).unwrap();
            for s in 0..chain.n_draws() {
                assert_abs_diff_eq!(chain.p.row(s).sum(), 1.0, epsilon = 1e-9);
                for r in 0..3 {
                    let row_sum: f64 = (0..3).map(|k| chain.m[[s, 0, r, k]]).sum();
                    assert_abs_diff_eq!(row_sum, 1.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn probabilistic_records_are_supported() {
        let causes = CauseSet::new(["A", "B"]).unwrap();
        let preds = vec![
            Prediction::Probabilities(vec![0.7, 0.3]),
            Prediction::Probabilities(vec![0.2, 0.8]),
            Prediction::from("A"),
        ];
        let unlabeled = PredictionMatrix::from_predictions(&preds, &causes, 1e-6, "va_unlabeled").unwrap();
        let labeled = PredictionMatrix::from_predictions(&preds[..2], &causes, 1e-6, "va_labeled").unwrap();
        let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B"]).unwrap();
        let sampler = GibbsSampler::new(data, Hyperparameters::default()).unwrap();
        let chain = sampler.run(100, 3).unwrap();
        assert!(chain.log_likelihood.iter().all(|l| l.is_finite()));
    }

    #[test]
    fn uncalibrated_chain_keeps_identity() {
        let sampler = GibbsSampler::new(all_a_data(), Hyperparameters::default())
            .unwrap()
            .uncalibrated();
        let mut chain = sampler.chain(5);
        let state = chain.step().unwrap();
        assert_eq!(state.m[0], Array2::<f64>::eye(3));
        assert!(state.gamma.is_none());
        // Every target record says "A", so every latent cause must be "A".
        assert!(state.z.iter().all(|&z| z == 0));
    }

    #[test]
    fn pshrink_lambda_pulls_toward_anchor() {
        let run = |lambda: f64| {
            let hyper = Hyperparameters::default().with_method(Method::pshrink(lambda));
            let chain = GibbsSampler::new(all_a_data(), hyper).unwrap().run(2_000, 9).unwrap();
            chain.p.slice(ndarray::s![500.., 0]).mean().unwrap()
        };
        let (low, high) = (run(0.1), run(100.0));
        assert!(high > low, "lambda=100 gave {high}, lambda=0.1 gave {low}");
        assert!(high > 0.98);
    }

    #[test]
    fn labeled_causes_can_enter_csmf_update() {
        let data = all_a_data();
        let hyper = Hyperparameters::default().with_labeled_in_csmf(true);
        let sampler = GibbsSampler::new(data, hyper).unwrap();
        let mut rng = SmallRng::seed_from_u64(0);
        // With no latent causes the labeled counts alone drive the draw.
        let mut mean = Array1::<f64>::zeros(3);
        for _ in 0..4_000 {
            mean += &sampler.model.draw_csmf(&[], &mut rng).unwrap();
        }
        mean /= 4_000.0;
        assert_abs_diff_eq!(mean[0], 0.5, epsilon = 0.03);
        assert_abs_diff_eq!(mean[1], 0.3, epsilon = 0.03);
    }
}
