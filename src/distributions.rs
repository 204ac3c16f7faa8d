/*!
Sampling primitives and log densities used by the Gibbs sweep.

- [`Dirichlet`] draws simplex vectors through log-space Gamma variates, so tiny
  concentrations such as `epsilon = 0.001` never underflow every coordinate to
  zero and normalisation never divides by zero.
- [`Categorical`] samples an index from unnormalised log weights.
- [`GammaPrior`] and [`LogNormalWalk`] implement [`TargetDistribution`] and
  [`ProposalDistribution`] for the Metropolis-Hastings update of a positive
  concentration parameter.

```rust
use calib_va::distributions::{Categorical, Dirichlet, DiscreteDistribution};
use ndarray::arr1;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(42);
let p = Dirichlet::new(arr1(&[0.001, 3.0, 2.0])).unwrap().sample(&mut rng).unwrap();
assert!((p.sum() - 1.0).abs() < 1e-12);

let cat = Categorical::from_log_weights(&[0.0, f64::NEG_INFINITY, 1.0]);
let i = cat.sample(&mut rng);
assert!(i == 0 || i == 2);
```
*/

use ndarray::{Array1, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, Gamma, Normal};
use special::Gamma as SpecialGamma;

use crate::error::{CalibError, Result};

/// A trait for targets of a scalar Metropolis-Hastings update.
pub trait TargetDistribution {
    /// Returns the log of the unnormalized density at `theta`.
    fn unnorm_log_prob(&self, theta: f64) -> f64;
}

/// A trait for generating scalar proposals in Metropolis-Hastings.
pub trait ProposalDistribution {
    /// Samples a new point from q(x' | x).
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64;

    /// Evaluates log q(to | from).
    fn log_prob(&self, from: f64, to: f64) -> f64;
}

/// A trait for discrete distributions whose state is represented as an index.
pub trait DiscreteDistribution {
    /// Samples an index from the distribution.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize;
}

pub(crate) fn ln_gamma(x: f64) -> f64 {
    SpecialGamma::ln_gamma(x).0
}

/// Numerically stable `log(sum(exp(x)))`. Returns `-inf` for an all `-inf` input.
pub fn log_sum_exp<'a, I>(values: I) -> f64
where
    I: IntoIterator<Item = &'a f64> + Clone,
{
    let max = values
        .clone()
        .into_iter()
        .fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values
        .into_iter()
        .map(|&v| (v - max).exp())
        .sum::<f64>()
        .ln()
}

/**
A categorical distribution over `0..n`, stored as normalized probabilities.

Built from log weights so that products of many small likelihoods stay
representable. If every weight is `-inf` the distribution falls back to uniform.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Categorical {
    pub probs: Vec<f64>,
}

impl Categorical {
    pub fn from_log_weights(log_weights: &[f64]) -> Self {
        let norm = log_sum_exp(log_weights);
        let probs = if norm.is_finite() {
            log_weights.iter().map(|w| (w - norm).exp()).collect()
        } else {
            vec![1.0 / log_weights.len() as f64; log_weights.len()]
        };
        Self { probs }
    }
}

impl DiscreteDistribution for Categorical {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let r: f64 = rng.gen();
        let mut cum = 0.0;
        for (i, &p) in self.probs.iter().enumerate() {
            cum += p;
            if r < cum {
                return i;
            }
        }
        // Rounding can leave `cum` just below 1; take the last supported index.
        self.probs
            .iter()
            .rposition(|&p| p > 0.0)
            .unwrap_or(self.probs.len() - 1)
    }
}

/// Dirichlet distribution with concentration vector `alpha`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dirichlet {
    pub alpha: Array1<f64>,
}

impl Dirichlet {
    /// Fails with [`CalibError::NumericDegeneracy`] on a non-positive or
    /// non-finite concentration, which only an accounting bug can produce.
    pub fn new(alpha: Array1<f64>) -> Result<Self> {
        if let Some((i, a)) = alpha
            .iter()
            .enumerate()
            .find(|(_, a)| !a.is_finite() || **a <= 0.0)
        {
            return Err(CalibError::NumericDegeneracy(format!(
                "Dirichlet concentration {i} is {a}"
            )));
        }
        Ok(Self { alpha })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array1<f64>> {
        let mut log_x = Array1::<f64>::zeros(self.alpha.len());
        for (lx, &a) in log_x.iter_mut().zip(self.alpha.iter()) {
            *lx = log_gamma_variate(a, rng)?;
        }
        let max = log_x.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        let mut x = log_x.mapv(|v| (v - max).exp());
        let total = x.sum();
        x /= total;
        Ok(x)
    }

    /// Normalized log density at `x`. Zero coordinates are clamped to the
    /// smallest positive float.
    pub fn ln_pdf(&self, x: ArrayView1<f64>) -> f64 {
        let total: f64 = self.alpha.sum();
        let mut lp = ln_gamma(total);
        for (&a, &xi) in self.alpha.iter().zip(x.iter()) {
            lp += (a - 1.0) * xi.max(f64::MIN_POSITIVE).ln() - ln_gamma(a);
        }
        lp
    }
}

/// Draws `log X` for `X ~ Gamma(shape, 1)`.
///
/// For `shape < 1` uses `X = Y * U^(1/shape)` with `Y ~ Gamma(shape + 1, 1)`,
/// kept in log space.
fn log_gamma_variate<R: Rng + ?Sized>(shape: f64, rng: &mut R) -> Result<f64> {
    let boost = shape < 1.0;
    let gamma = Gamma::new(if boost { shape + 1.0 } else { shape }, 1.0)
        .map_err(|e| CalibError::NumericDegeneracy(format!("Gamma({shape}): {e}")))?;
    let y: f64 = gamma.sample(rng);
    if boost {
        let u: f64 = 1.0 - rng.gen::<f64>();
        Ok(y.ln() + u.ln() / shape)
    } else {
        Ok(y.ln())
    }
}

/// `Gamma(shape, rate)` density used as the prior of a concentration parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaPrior {
    pub shape: f64,
    pub rate: f64,
}

impl TargetDistribution for GammaPrior {
    fn unnorm_log_prob(&self, theta: f64) -> f64 {
        if theta <= 0.0 {
            return f64::NEG_INFINITY;
        }
        (self.shape - 1.0) * theta.ln() - self.rate * theta
    }
}

/// Multiplicative random walk: `log x' = log x + N(0, scale^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogNormalWalk {
    pub scale: f64,
}

impl ProposalDistribution for LogNormalWalk {
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64 {
        match Normal::new(0.0, self.scale) {
            Ok(normal) => current * normal.sample(rng).exp(),
            Err(_) => current,
        }
    }

    fn log_prob(&self, from: f64, to: f64) -> f64 {
        // Density of `to` under the walk, including the 1/to Jacobian.
        let diff = to.ln() - from.ln();
        -(diff * diff) / (2.0 * self.scale * self.scale) - to.ln()
    }
}
