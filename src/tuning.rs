/*!
# Shrinkage-strength selection by WAIC

[`tune`] scores every candidate strength (`alpha` under mshrink, `lambda` under
pshrink) by the WAIC of its pooled post-burn-in draws, also scores the
uncalibrated model, and keeps the candidate with the smallest WAIC.

Candidates come either from a grid, run here with candidate `i` seeded
`seed + i * nchains`, or as precomputed posteriors drawn elsewhere. The same
chains give the same table either way.

```rust
use calib_va::config::{Hyperparameters, Method};
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};
use calib_va::gibbs::GibbsSampler;
use calib_va::tuning::{tune, TuneConfig, TuneInput};

let causes = CauseSet::new(["A", "B"]).unwrap();
let unlabeled = PredictionMatrix::from_labels(&["A", "B", "B", "A", "B"], &causes, "va_unlabeled").unwrap();
let labeled = PredictionMatrix::from_labels(&["A", "B", "B"], &causes, "va_labeled").unwrap();
let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B", "A"]).unwrap();
let sampler = GibbsSampler::new(data, Hyperparameters::default().with_method(Method::pshrink(1.0))).unwrap();

let config = TuneConfig::default().with_draws(200, 100, 2).with_chains(2).with_seed(1);
let result = tune(&sampler, TuneInput::Grid(vec![0.1, 1.0, 10.0]), &config).unwrap();
assert_eq!(result.table.len(), 3);
assert!([0.1, 1.0, 10.0].contains(&result.best_value));
```
*/

use std::fmt;

use log::{info, warn};
use rayon::prelude::*;

use crate::chains::{kept_draws, run_chains, Posterior};
use crate::config::Method;
use crate::core::RunOptions;
use crate::error::{CalibError, Result};
use crate::gibbs::CalibrationSampler;
use crate::stats::{max_split_rhat, pointwise_matrix, waic, Waic};

/// WAIC values closer than this are ties.
pub const WAIC_TIE_TOLERANCE: f64 = 1e-9;

/// Candidate strengths to score.
#[derive(Debug, Clone)]
pub enum TuneInput {
    /// Values to run here.
    Grid(Vec<f64>),
    /// `(value, posterior)` pairs already drawn, e.g. on other machines.
    Precomputed(Vec<(f64, Posterior)>),
}

/// Run and extraction settings shared by every candidate.
#[derive(Debug, Clone)]
pub struct TuneConfig {
    pub nchains: usize,
    pub ndraws: usize,
    pub burnin: usize,
    pub thin: usize,
    pub seed: u64,
    pub options: RunOptions,
    /// Split R-hat above this flags a candidate.
    pub rhat_threshold: f64,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            nchains: 3,
            ndraws: 10_000,
            burnin: 1_000,
            thin: 10,
            seed: 123,
            options: RunOptions::default(),
            rhat_threshold: 1.1,
        }
    }
}

impl TuneConfig {
    pub fn with_chains(mut self, nchains: usize) -> Self {
        self.nchains = nchains;
        self
    }

    pub fn with_draws(mut self, ndraws: usize, burnin: usize, thin: usize) -> Self {
        self.ndraws = ndraws;
        self.burnin = burnin;
        self.thin = thin;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Seed of the first chain of grid candidate `i`, wrapping at `u64::MAX`.
    pub fn candidate_seed(&self, i: usize) -> u64 {
        self.seed.wrapping_add((i as u64).wrapping_mul(self.nchains as u64))
    }
}

/// Non-fatal sign that a candidate's chains may not have mixed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergenceWarning {
    HighRhat { rhat: f64, threshold: f64 },
    InvalidPenalty { p_waic: f64 },
    NonFiniteWaic { waic: f64 },
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceWarning::HighRhat { rhat, threshold } => {
                write!(f, "max split R-hat {rhat:.3} exceeds {threshold}")
            }
            ConvergenceWarning::InvalidPenalty { p_waic } => {
                write!(f, "WAIC penalty p_waic = {p_waic} is not a finite non-negative number")
            }
            ConvergenceWarning::NonFiniteWaic { waic } => write!(f, "WAIC is {waic}"),
        }
    }
}

/// One row of the tuning table.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: f64,
    pub waic: Waic,
    pub max_rhat: f64,
    pub warnings: Vec<ConvergenceWarning>,
}

#[derive(Debug, Clone)]
pub struct TuneResult {
    pub best_model: Posterior,
    pub best_value: f64,
    /// Every candidate, in input order.
    pub table: Vec<Candidate>,
    /// WAIC of the uncalibrated model.
    pub baseline: Waic,
}

impl TuneResult {
    /// `(value, WAIC)` for every candidate.
    pub fn waic_table(&self) -> Vec<(f64, f64)> {
        self.table.iter().map(|c| (c.value, c.waic.waic)).collect()
    }
}

/// Scores every candidate of `input` with `sampler`'s data and method and
/// keeps the one with the smallest finite WAIC.
///
/// Ties go to the value closest to the method's default strength. Fails with
/// [`CalibError::NumericDegeneracy`] when no candidate has a finite WAIC.
pub fn tune<S: CalibrationSampler>(
    sampler: &S,
    input: TuneInput,
    config: &TuneConfig,
) -> Result<TuneResult> {
    let method = &sampler.hyperparameters().method;
    check_config(config)?;
    let candidates: Vec<(f64, Posterior)> = match input {
        TuneInput::Grid(grid) => {
            if grid.is_empty() {
                return Err(CalibError::invalid("grid", "no candidate values"));
            }
            let samplers = grid
                .iter()
                .map(|&v| sampler.with_method(method.with_strength(v)))
                .collect::<Result<Vec<S>>>()?;
            info!(
                "Tuning {} over {} values with {} chains each",
                method.name(),
                grid.len(),
                config.nchains
            );
            let posteriors = samplers
                .par_iter()
                .enumerate()
                .map(|(i, s)| {
                    run_chains(
                        config.nchains,
                        config.candidate_seed(i),
                        s,
                        config.ndraws,
                        &config.options,
                    )
                })
                .collect::<Result<Vec<Posterior>>>()?;
            grid.into_iter().zip(posteriors).collect()
        }
        TuneInput::Precomputed(list) => {
            if list.is_empty() {
                return Err(CalibError::invalid("samples", "no precomputed posteriors"));
            }
            for (value, posterior) in &list {
                check_precomputed(*value, posterior, method, config)?;
            }
            list
        }
    };

    let table = candidates
        .par_iter()
        .map(|(value, posterior)| score(sampler, *value, posterior, config))
        .collect::<Result<Vec<Candidate>>>()?;

    let baseline_seed = config.candidate_seed(candidates.len());
    let uncalibrated = sampler.uncalibrated();
    let baseline_posterior = run_chains(
        config.nchains,
        baseline_seed,
        &uncalibrated,
        config.ndraws,
        &config.options,
    )?;
    let baseline_ll = pointwise_matrix(&uncalibrated, &baseline_posterior, config.burnin, config.thin)?;
    let baseline = waic(baseline_ll.view())?;
    info!("Uncalibrated baseline WAIC {:.3}", baseline.waic);

    let best = select(&table, method.default_strength()).ok_or_else(|| {
        CalibError::NumericDegeneracy("no candidate produced a finite WAIC".to_string())
    })?;
    let best_value = table[best].value;
    info!("Selected {} strength {best_value}", method.name());

    let mut candidates = candidates;
    let (_, best_model) = candidates.swap_remove(best);
    Ok(TuneResult {
        best_model,
        best_value,
        table,
        baseline,
    })
}

/// Rejects run and extraction settings that would leave no retained draws.
fn check_config(config: &TuneConfig) -> Result<()> {
    if config.nchains == 0 {
        return Err(CalibError::invalid("nchains", "must be at least 1"));
    }
    if config.ndraws == 0 {
        return Err(CalibError::invalid("ndraws", "must be at least 1"));
    }
    kept_draws(config.ndraws, config.burnin, config.thin)?;
    Ok(())
}

fn check_precomputed(value: f64, posterior: &Posterior, method: &Method, config: &TuneConfig) -> Result<()> {
    if posterior.method.name() != method.name() {
        return Err(CalibError::invalid(
            "samples",
            format!(
                "posterior for value {value} was drawn with {} but the sampler uses {}",
                posterior.method.name(),
                method.name()
            ),
        ));
    }
    if posterior.method.strength() != value {
        return Err(CalibError::invalid(
            "samples",
            format!(
                "posterior listed under value {value} was drawn with strength {}",
                posterior.method.strength()
            ),
        ));
    }
    if posterior.chains.is_empty() {
        return Err(CalibError::invalid(
            "samples",
            format!("posterior for value {value} has no chains"),
        ));
    }
    for chain in &posterior.chains {
        kept_draws(chain.n_draws(), config.burnin, config.thin)?;
    }
    Ok(())
}

fn score<S: CalibrationSampler>(
    sampler: &S,
    value: f64,
    posterior: &Posterior,
    config: &TuneConfig,
) -> Result<Candidate> {
    let ll = pointwise_matrix(sampler, posterior, config.burnin, config.thin)?;
    let waic = waic(ll.view())?;
    let max_rhat = max_split_rhat(&posterior.csmf_by_chain(config.burnin, config.thin)?)?;

    let mut warnings = Vec::new();
    if max_rhat > config.rhat_threshold {
        warnings.push(ConvergenceWarning::HighRhat {
            rhat: max_rhat,
            threshold: config.rhat_threshold,
        });
    }
    if !waic.p_waic.is_finite() || waic.p_waic < 0.0 {
        warnings.push(ConvergenceWarning::InvalidPenalty { p_waic: waic.p_waic });
    }
    if !waic.waic.is_finite() {
        warnings.push(ConvergenceWarning::NonFiniteWaic { waic: waic.waic });
    }
    for w in &warnings {
        warn!("Candidate {value}: {w}");
    }
    info!(
        "Candidate {value}: WAIC {:.3} (lppd {:.3}, p_waic {:.3}), max R-hat {:.3}",
        waic.waic, waic.lppd, waic.p_waic, max_rhat
    );
    Ok(Candidate {
        value,
        waic,
        max_rhat,
        warnings,
    })
}

/// Index of the smallest finite WAIC, ties broken toward `default_strength`.
fn select(table: &[Candidate], default_strength: f64) -> Option<usize> {
    table
        .iter()
        .enumerate()
        .filter(|(_, c)| c.waic.waic.is_finite())
        .fold(None, |best: Option<(usize, &Candidate)>, (i, c)| match best {
            None => Some((i, c)),
            Some((_, b)) => {
                let diff = c.waic.waic - b.waic.waic;
                let closer = (c.value - default_strength).abs() < (b.value - default_strength).abs();
                if diff < -WAIC_TIE_TOLERANCE || (diff.abs() <= WAIC_TIE_TOLERANCE && closer) {
                    Some((i, c))
                } else {
                    best
                }
            }
        })
        .map(|(i, _)| i)
}
