/*!
# Multi-chain driver and draw storage

[`run_chains`] runs independent chains of any [`CalibrationSampler`] in
parallel with rayon, chain `i` seeded with `seed + i`. Every sweep is stored in
a [`Chain`]; [`extract_csmf`] and [`Posterior::pooled_csmf`] then drop burn-in
and thin.

```rust
use calib_va::chains::run_chains;
use calib_va::config::Hyperparameters;
use calib_va::core::RunOptions;
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};
use calib_va::gibbs::GibbsSampler;

let causes = CauseSet::new(["A", "B"]).unwrap();
let unlabeled = PredictionMatrix::from_labels(&["A", "B", "B"], &causes, "va_unlabeled").unwrap();
let labeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_labeled").unwrap();
let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B"]).unwrap();
let sampler = GibbsSampler::new(data, Hyperparameters::default()).unwrap();

let posterior = run_chains(2, 42, &sampler, 100, &RunOptions::default()).unwrap();
let csmf = posterior.pooled_csmf(50, 5).unwrap();
assert_eq!(csmf.values.nrows(), 2 * 10);
```
*/

use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, Axis};
use rayon::prelude::*;

use crate::config::Method;
use crate::core::{run_chain, run_chain_with_progress, ChainProgress, RunOptions};
use crate::data::CauseSet;
use crate::error::{CalibError, Result};
use crate::gibbs::{CalibrationSampler, SweepState};

/// Every sweep of one chain, stored draw-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pub seed: u64,
    /// `ndraws x C`
    pub p: Array2<f64>,
    /// `ndraws x K x C x C`, indexed `[draw, source, true, predicted]`.
    pub m: Array4<f64>,
    /// `ndraws x K x C`; mshrink only.
    pub gamma: Option<Array3<f64>>,
    /// `ndraws x N`
    pub z: Array2<usize>,
    pub log_likelihood: Array1<f64>,
    /// Row-concentration moves accepted over all stored sweeps.
    pub gamma_accepted: usize,
}

impl Chain {
    /// Zeroed storage for `ndraws` sweeps of `sampler`.
    pub fn allocate<S: CalibrationSampler>(seed: u64, ndraws: usize, sampler: &S) -> Result<Self> {
        if ndraws == 0 {
            return Err(CalibError::invalid("ndraws", "must be at least 1"));
        }
        let c = sampler.causes().len();
        let k = sampler.n_sources();
        Ok(Self {
            seed,
            p: Array2::zeros((ndraws, c)),
            m: Array4::zeros((ndraws, k, c, c)),
            gamma: None,
            z: Array2::zeros((ndraws, sampler.n_unlabeled())),
            log_likelihood: Array1::zeros(ndraws),
            gamma_accepted: 0,
        })
    }

    /// Stores `state` as draw `i`.
    pub fn record(&mut self, i: usize, state: &SweepState) {
        self.p.row_mut(i).assign(&state.p);
        let mut m = self.m.index_axis_mut(Axis(0), i);
        for (k, mk) in state.m.iter().enumerate() {
            m.index_axis_mut(Axis(0), k).assign(mk);
        }
        if let Some(gamma) = &state.gamma {
            let (ndraws, (k, c)) = (self.p.nrows(), gamma.dim());
            self.gamma
                .get_or_insert_with(|| Array3::zeros((ndraws, k, c)))
                .index_axis_mut(Axis(0), i)
                .assign(gamma);
        }
        self.z
            .row_mut(i)
            .iter_mut()
            .zip(&state.z)
            .for_each(|(dst, &src)| *dst = src);
        self.log_likelihood[i] = state.log_likelihood;
        self.gamma_accepted += state.gamma_accepted;
    }

    pub fn n_draws(&self) -> usize {
        self.p.nrows()
    }

    /// Share of row-concentration moves accepted; `None` without mshrink.
    pub fn gamma_acceptance_rate(&self) -> Option<f64> {
        let gamma = self.gamma.as_ref()?;
        Some(self.gamma_accepted as f64 / gamma.len() as f64)
    }
}

/// Draw indices `burnin, burnin + thin, ...` below `ndraws`.
pub(crate) fn kept_draws(ndraws: usize, burnin: usize, thin: usize) -> Result<Vec<usize>> {
    if thin == 0 {
        return Err(CalibError::invalid("thin", "must be at least 1"));
    }
    if burnin >= ndraws {
        return Err(CalibError::invalid(
            "burnin",
            format!("burn-in of {burnin} leaves nothing of {ndraws} draws"),
        ));
    }
    Ok((burnin..ndraws).step_by(thin).collect())
}

/// Retained CSMF draws, one column per cause.
#[derive(Debug, Clone, PartialEq)]
pub struct CsmfDraws {
    pub causes: Vec<String>,
    /// `draws x C`
    pub values: Array2<f64>,
}

impl CsmfDraws {
    pub fn n_draws(&self) -> usize {
        self.values.nrows()
    }

    /// `(cause, draws)` for every cause.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, ArrayView1<'_, f64>)> {
        self.causes
            .iter()
            .map(String::as_str)
            .zip(self.values.axis_iter(Axis(1)))
    }

    /// Draws of one cause by label.
    pub fn cause(&self, label: &str) -> Option<ArrayView1<'_, f64>> {
        self.causes
            .iter()
            .position(|c| c == label)
            .map(|i| self.values.column(i))
    }
}

/// Drops the first `burnin` draws of `chain` and keeps every `thin`-th one after.
pub fn extract_csmf(chain: &Chain, causes: &CauseSet, burnin: usize, thin: usize) -> Result<CsmfDraws> {
    let keep = kept_draws(chain.n_draws(), burnin, thin)?;
    Ok(CsmfDraws {
        causes: causes.labels().to_vec(),
        values: chain.p.select(Axis(0), &keep),
    })
}

/// All chains of one run, with the settings that produced them.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub causes: CauseSet,
    pub method: Method,
    pub chains: Vec<Chain>,
}

impl Posterior {
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn n_draws(&self) -> usize {
        self.chains.first().map_or(0, Chain::n_draws)
    }

    /// Retained CSMF draws of every chain, in chain order.
    pub fn csmf_by_chain(&self, burnin: usize, thin: usize) -> Result<Vec<CsmfDraws>> {
        self.chains
            .iter()
            .map(|chain| extract_csmf(chain, &self.causes, burnin, thin))
            .collect()
    }

    /// Retained CSMF draws of every chain, stacked.
    pub fn pooled_csmf(&self, burnin: usize, thin: usize) -> Result<CsmfDraws> {
        let per_chain = self.csmf_by_chain(burnin, thin)?;
        let views: Vec<_> = per_chain.iter().map(|d| d.values.view()).collect();
        let values = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| CalibError::invalid("chains", e.to_string()))?;
        Ok(CsmfDraws {
            causes: self.causes.labels().to_vec(),
            values,
        })
    }

    /// Posterior mean of every misclassification cell of source `k`, over
    /// retained draws of every chain.
    pub fn mean_misclassification(&self, k: usize, burnin: usize, thin: usize) -> Result<Array2<f64>> {
        let c = self.causes.len();
        let mut total = Array2::<f64>::zeros((c, c));
        let mut n = 0usize;
        for chain in &self.chains {
            for i in kept_draws(chain.n_draws(), burnin, thin)? {
                total += &chain.m.slice(s![i, k, .., ..]);
                n += 1;
            }
        }
        Ok(total / n.max(1) as f64)
    }
}

/// Runs `nchains` chains of `ndraws` sweeps in parallel; chain `i` is seeded
/// with `seed + i`, wrapping at `u64::MAX`.
pub fn run_chains<S: CalibrationSampler>(
    nchains: usize,
    seed: u64,
    sampler: &S,
    ndraws: usize,
    options: &RunOptions,
) -> Result<Posterior> {
    if nchains == 0 {
        return Err(CalibError::invalid("nchains", "must be at least 1"));
    }
    if ndraws == 0 {
        return Err(CalibError::invalid("ndraws", "must be at least 1"));
    }
    let method = sampler.hyperparameters().method.clone();
    info!(
        "Running {nchains} {} chains of {ndraws} draws (strength {}, seed {seed})",
        method.name(),
        method.strength()
    );

    let progress = options.progress.then(ChainProgress::new);
    let chains = (0..nchains)
        .into_par_iter()
        .map(|i| {
            let chain_seed = seed.wrapping_add(i as u64);
            let mut chain = sampler.chain(chain_seed);
            let mut out = Chain::allocate(chain_seed, ndraws, sampler)?;
            match &progress {
                Some(progress) => {
                    let pb = progress.bar(i, ndraws);
                    run_chain_with_progress(&mut chain, ndraws, options, &pb, |j, s| {
                        out.record(j, s)
                    })?;
                    pb.finish_with_message("Done!");
                }
                None => run_chain(&mut chain, ndraws, options, |j, s| out.record(j, s))?,
            }
            match out.gamma_acceptance_rate() {
                Some(rate) => debug!("Chain {i} (seed {chain_seed}) finished, gamma acceptance {rate:.3}"),
                None => debug!("Chain {i} (seed {chain_seed}) finished"),
            }
            Ok(out)
        })
        .collect::<Result<Vec<Chain>>>()?;

    Ok(Posterior {
        causes: sampler.causes().clone(),
        method,
        chains,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hyperparameters;
    use crate::data::{CalibrationData, PredictionMatrix};
    use crate::gibbs::GibbsSampler;
    use approx::assert_abs_diff_eq;

    fn sampler() -> GibbsSampler {
        let causes = CauseSet::new(["A", "B", "C"]).unwrap();
        let unlabeled =
            PredictionMatrix::from_labels(&["A", "A", "B", "C", "C", "C"], &causes, "va_unlabeled")
                .unwrap();
        let labeled = PredictionMatrix::from_labels(&["A", "B", "C", "A"], &causes, "va_labeled").unwrap();
        let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B", "C", "B"]).unwrap();
        GibbsSampler::new(data, Hyperparameters::default()).unwrap()
    }

    #[test]
    fn kept_draws_follow_burnin_and_thin() {
        assert_eq!(kept_draws(10, 3, 3).unwrap(), vec![3, 6, 9]);
        assert_eq!(kept_draws(10, 9, 100).unwrap(), vec![9]);
        assert_eq!(kept_draws(100, 0, 1).unwrap().len(), 100);
        assert!(kept_draws(10, 10, 1).is_err());
        assert!(kept_draws(10, 0, 0).is_err());
    }

    #[test]
    fn chain_i_matches_single_run_with_seed_plus_i() {
        let sampler = sampler();
        let posterior = run_chains(3, 100, &sampler, 40, &RunOptions::default()).unwrap();
        assert_eq!(posterior.n_chains(), 3);
        for (i, chain) in posterior.chains.iter().enumerate() {
            let single = sampler.run(40, 100 + i as u64).unwrap();
            assert_eq!(chain.seed, 100 + i as u64);
            assert_eq!(chain.p, single.p);
            assert_eq!(chain.z, single.z);
        }
    }

    #[test]
    fn record_stores_gamma_for_mshrink() {
        let chain = sampler().run(20, 1).unwrap();
        let gamma = chain.gamma.as_ref().unwrap();
        assert_eq!(gamma.dim(), (20, 1, 3));
        assert!(gamma.iter().all(|&g| g > 0.0));
        let rate = chain.gamma_acceptance_rate().unwrap();
        assert!((0.0..=1.0).contains(&rate));
        assert!(chain.gamma_accepted > 0);
    }

    #[test]
    fn pshrink_chains_have_no_gamma_moves() {
        let sampler = sampler()
            .with_method(crate::config::Method::pshrink(1.0))
            .unwrap();
        let chain = sampler.run(20, 1).unwrap();
        assert_eq!(chain.gamma_acceptance_rate(), None);
        assert_eq!(chain.gamma_accepted, 0);
    }

    #[test]
    fn seeds_wrap_at_the_top_of_the_range() {
        let sampler = sampler();
        let posterior = run_chains(2, u64::MAX, &sampler, 5, &RunOptions::default()).unwrap();
        assert_eq!(posterior.chains[0].seed, u64::MAX);
        assert_eq!(posterior.chains[1].seed, 0);
        assert_eq!(posterior.chains[1].p, sampler.run(5, 0).unwrap().p);
    }

    #[test]
    fn pooled_csmf_stacks_thinned_draws() {
        let posterior = run_chains(2, 5, &sampler(), 30, &RunOptions::default()).unwrap();
        let pooled = posterior.pooled_csmf(10, 4).unwrap();
        // Draws 10, 14, ..., 26 of each chain.
        assert_eq!(pooled.n_draws(), 2 * 5);
        assert_eq!(pooled.causes, vec!["A", "B", "C"]);
        for row in pooled.values.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        assert_eq!(pooled.values.row(0), posterior.chains[0].p.row(10));
        assert_eq!(pooled.cause("B").unwrap().len(), 10);
        assert!(pooled.cause("Z").is_none());
    }

    #[test]
    fn extraction_rejects_burnin_past_the_end() {
        let posterior = run_chains(1, 5, &sampler(), 10, &RunOptions::default()).unwrap();
        assert!(matches!(
            posterior.pooled_csmf(10, 1),
            Err(CalibError::InvalidInput { .. })
        ));
    }

    #[test]
    fn rejects_empty_runs() {
        let sampler = sampler();
        assert!(run_chains(0, 1, &sampler, 10, &RunOptions::default()).is_err());
        assert!(run_chains(1, 1, &sampler, 0, &RunOptions::default()).is_err());
    }

    #[test]
    fn mean_misclassification_rows_sum_to_one() {
        let posterior = run_chains(2, 3, &sampler(), 50, &RunOptions::default()).unwrap();
        let m = posterior.mean_misclassification(0, 10, 1).unwrap();
        for row in m.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }
}
