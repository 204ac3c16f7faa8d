//! Model-fit and convergence statistics: pointwise log-likelihood, WAIC and
//! split potential scale reduction (R-hat) over CSMF draws.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;

use crate::chains::{kept_draws, CsmfDraws, Posterior};
use crate::distributions::log_sum_exp;
use crate::error::{CalibError, Result};
use crate::gibbs::CalibrationSampler;

/// Online potential scale reduction over several chains stepped in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one draw per chain (`n_chains x n_params`).
    pub fn step(&mut self, x: ArrayView2<f64>) -> Result<()> {
        if x.dim() != (self.n_chains, self.n_params) {
            return Err(CalibError::invalid(
                "x",
                format!(
                    "expected {}x{} draws, got {:?}",
                    self.n_chains,
                    self.n_params,
                    x.dim()
                ),
            ));
        }
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + x) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x.pow2()) / n;
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>> {
        if self.n < 2 || self.n_chains < 2 {
            return Err(CalibError::invalid(
                "chains",
                format!(
                    "R-hat needs 2 chains of 2 draws, got {} of {}",
                    self.n_chains, self.n
                ),
            ));
        }
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| CalibError::invalid("chains", "no chains"))?;
        let n_chains = self.n_chains as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| CalibError::invalid("chains", "no chains"))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    /// Largest finite R-hat; NaN when none is finite.
    pub fn max(&self) -> Result<f64> {
        let finite: Array1<f64> = self.all()?.into_iter().filter(|v| v.is_finite()).collect();
        Ok(finite.max().map_or(f64::NAN, |m| *m))
    }
}

/// Split R-hat per cause: each chain's retained draws are cut into a first and
/// second half, treated as separate chains.
///
/// NaN for every cause when some chain has fewer than 4 retained draws.
pub fn split_rhat(draws: &[CsmfDraws]) -> Result<Array1<f64>> {
    match split_accumulator(draws)? {
        Some(rhat) => rhat.all(),
        None => Ok(Array1::from_elem(draws[0].causes.len(), f64::NAN)),
    }
}

/// Largest finite split R-hat over causes; NaN when none is finite.
pub fn max_split_rhat(draws: &[CsmfDraws]) -> Result<f64> {
    match split_accumulator(draws)? {
        Some(rhat) => rhat.max(),
        None => Ok(f64::NAN),
    }
}

/// Feeds the half-chains of `draws` into a [`RhatMulti`]; `None` when some
/// chain is too short to split.
fn split_accumulator(draws: &[CsmfDraws]) -> Result<Option<RhatMulti>> {
    let Some(first) = draws.first() else {
        return Err(CalibError::invalid("draws", "no chains"));
    };
    let c = first.causes.len();
    let n = draws.iter().map(CsmfDraws::n_draws).min().unwrap_or(0);
    let half = n / 2;
    if half < 2 {
        return Ok(None);
    }
    let mut rhat = RhatMulti::new(2 * draws.len(), c);
    let mut x = Array2::<f64>::zeros((2 * draws.len(), c));
    for t in 0..half {
        for (i, d) in draws.iter().enumerate() {
            x.row_mut(2 * i).assign(&d.values.row(t));
            x.row_mut(2 * i + 1).assign(&d.values.row(n - half + t));
        }
        rhat.step(x.view())?;
    }
    Ok(Some(rhat))
}

/// Widely applicable information criterion with the variance penalty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waic {
    pub waic: f64,
    /// Log pointwise predictive density, summed over individuals.
    pub lppd: f64,
    /// Effective number of parameters.
    pub p_waic: f64,
}

/// WAIC from an `S x N` matrix of pointwise log-likelihoods (draws by individuals).
pub fn waic(log_lik: ArrayView2<f64>) -> Result<Waic> {
    let (s, n) = log_lik.dim();
    if s < 2 {
        return Err(CalibError::invalid(
            "log_lik",
            format!("WAIC needs at least 2 draws, got {s}"),
        ));
    }
    if n == 0 {
        return Err(CalibError::invalid("log_lik", "no individuals"));
    }
    let ln_s = (s as f64).ln();
    let lppd: f64 = log_lik
        .axis_iter(Axis(1))
        .map(|col| log_sum_exp(col.iter()) - ln_s)
        .sum();
    let p_waic = log_lik.var_axis(Axis(0), 1.0).sum();
    Ok(Waic {
        waic: -2.0 * (lppd - p_waic),
        lppd,
        p_waic,
    })
}

/// Pointwise target log-likelihood of every retained draw of every chain,
/// stacked chain-major (`S x N_U`).
pub fn pointwise_matrix<S: CalibrationSampler>(
    sampler: &S,
    posterior: &Posterior,
    burnin: usize,
    thin: usize,
) -> Result<Array2<f64>> {
    let n_unlabeled = sampler.n_unlabeled();
    let per_chain = posterior
        .chains
        .par_iter()
        .map(|chain| {
            if chain.m.dim().1 != sampler.n_sources() || chain.z.ncols() != n_unlabeled {
                return Err(CalibError::invalid(
                    "posterior",
                    "chains were not drawn from this data set",
                ));
            }
            let keep = kept_draws(chain.n_draws(), burnin, thin)?;
            let mut out = Array2::<f64>::zeros((keep.len(), n_unlabeled));
            for (mut row, &s) in out.axis_iter_mut(Axis(0)).zip(&keep) {
                let m_s = chain.m.index_axis(Axis(0), s);
                let m: Vec<ArrayView2<f64>> = m_s.outer_iter().collect();
                row.assign(&sampler.pointwise_log_likelihood(chain.p.row(s), &m));
            }
            Ok(out)
        })
        .collect::<Result<Vec<Array2<f64>>>>()?;
    let views: Vec<ArrayView2<f64>> = per_chain.iter().map(|a| a.view()).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|e| CalibError::invalid("posterior", e.to_string()))
}
