/*!
# Metropolis-Hastings update for a positive scalar

The misclassification concentration `gamma_i` of each row has no conjugate
update, so the Gibbs sweep embeds one Metropolis-Hastings step per row. The
target is anything implementing [`TargetDistribution`]; the proposal anything
implementing [`ProposalDistribution`].

```rust
use calib_va::distributions::{GammaPrior, LogNormalWalk};
use calib_va::metropolis_hastings::mh_step;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(42);
let target = GammaPrior { shape: 2.0, rate: 1.0 };
let proposal = LogNormalWalk { scale: 0.5 };
let (next, _accepted) = mh_step(&target, &proposal, 1.0, &mut rng);
assert!(next > 0.0);
```
*/

use rand::Rng;

use crate::distributions::{
    Dirichlet, GammaPrior, LogNormalWalk, ProposalDistribution, TargetDistribution,
};
use ndarray::{Array1, ArrayView1};

/**
Performs one Metropolis-Hastings update of `current`.

The acceptance ratio in log space is

\[
\log \alpha = \left[\log p(\text{proposed}) + \log q(\text{current} \mid \text{proposed})\right]
              - \left[\log p(\text{current}) + \log q(\text{proposed} \mid \text{current})\right]
\]

Returns the new value and whether the proposal was accepted.
*/
pub fn mh_step<D, Q, R>(target: &D, proposal: &Q, current: f64, rng: &mut R) -> (f64, bool)
where
    D: TargetDistribution,
    Q: ProposalDistribution,
    R: Rng + ?Sized,
{
    let proposed = proposal.sample(current, rng);
    let current_lp = target.unnorm_log_prob(current);
    let proposed_lp = target.unnorm_log_prob(proposed);
    let log_q_forward = proposal.log_prob(current, proposed);
    let log_q_backward = proposal.log_prob(proposed, current);
    let log_accept_ratio = (proposed_lp + log_q_backward) - (current_lp + log_q_forward);
    let u: f64 = rng.gen();
    if log_accept_ratio.is_finite() && log_accept_ratio > u.ln() {
        (proposed, true)
    } else {
        (current, false)
    }
}

/// Full conditional of `gamma_i` given row `i` of a misclassification matrix:
/// `Gamma(alpha, beta)` prior times `Dirichlet(row | gamma * e_i + delta)`.
#[derive(Debug, Clone)]
pub struct RowConcentration<'a> {
    pub prior: GammaPrior,
    pub delta: f64,
    pub cause: usize,
    pub row: ArrayView1<'a, f64>,
}

impl RowConcentration<'_> {
    /// Dirichlet prior of the row for a given concentration.
    pub fn row_prior(gamma: f64, delta: f64, cause: usize, n_causes: usize) -> Array1<f64> {
        let mut alpha = Array1::from_elem(n_causes, delta);
        alpha[cause] += gamma;
        alpha
    }
}

impl TargetDistribution for RowConcentration<'_> {
    fn unnorm_log_prob(&self, gamma: f64) -> f64 {
        let prior = self.prior.unnorm_log_prob(gamma);
        if !prior.is_finite() {
            return f64::NEG_INFINITY;
        }
        let alpha = Self::row_prior(gamma, self.delta, self.cause, self.row.len());
        match Dirichlet::new(alpha) {
            Ok(dirichlet) => prior + dirichlet.ln_pdf(self.row),
            Err(_) => f64::NEG_INFINITY,
        }
    }
}

/// Updates `gamma` for one row; returns whether the move was accepted.
pub fn update_row_concentration<R: Rng + ?Sized>(
    target: &RowConcentration<'_>,
    tau: f64,
    gamma: &mut f64,
    rng: &mut R,
) -> bool {
    let (next, accepted) = mh_step(target, &LogNormalWalk { scale: tau }, *gamma, rng);
    *gamma = next;
    accepted
}
