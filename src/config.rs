/*!
# Prior and hyperparameter configuration

[`Hyperparameters`] bundles the CSMF prior and the shrinkage strategy. The
strategy is a [`Method`] chosen once, each variant carrying only what it needs:

- [`Method::MShrink`] shrinks every misclassification row toward the identity
  with a per-row concentration `gamma_i ~ Gamma(alpha, beta)`.
- [`Method::PShrink`] leaves the misclassification rows flat and instead shrinks
  the CSMF toward the raw predicted CSMF with strength `lambda`.

```rust
use calib_va::config::{Hyperparameters, Method};

let hyper = Hyperparameters::default().with_method(Method::pshrink(10.0));
assert!(hyper.validate(3).is_ok());
assert_eq!(hyper.method.strength(), 10.0);
```
*/

use crate::error::{CalibError, Result};

/// Misclassification-shrinkage hyperparameters.
///
/// Row `i` of a misclassification matrix has prior
/// `Dirichlet(gamma_i * e_i + delta)`. `tau` and `gamma_init` hold either one
/// value shared by every row or one value per cause.
#[derive(Debug, Clone, PartialEq)]
pub struct MShrink {
    /// Shape of the Gamma prior on each `gamma_i`.
    pub alpha: f64,
    /// Rate of the Gamma prior on each `gamma_i`.
    pub beta: f64,
    /// Pseudo-count added to every cell of every row.
    pub delta: f64,
    /// Scale of the log-normal random walk proposing new `gamma_i`.
    pub tau: Vec<f64>,
    /// Starting value of every `gamma_i`.
    pub gamma_init: Vec<f64>,
}

impl MShrink {
    pub const DEFAULT_ALPHA: f64 = 5.0;
    pub const DEFAULT_BETA: f64 = 0.5;
    pub const DEFAULT_DELTA: f64 = 1.0;
    pub const DEFAULT_TAU: f64 = 0.5;
    pub const DEFAULT_GAMMA_INIT: f64 = 1.0;

    pub fn tau_at(&self, i: usize) -> f64 {
        broadcast(&self.tau, i)
    }

    pub fn gamma_init_at(&self, i: usize) -> f64 {
        broadcast(&self.gamma_init, i)
    }
}

impl Default for MShrink {
    fn default() -> Self {
        Self {
            alpha: Self::DEFAULT_ALPHA,
            beta: Self::DEFAULT_BETA,
            delta: Self::DEFAULT_DELTA,
            tau: vec![Self::DEFAULT_TAU],
            gamma_init: vec![Self::DEFAULT_GAMMA_INIT],
        }
    }
}

/// CSMF-shrinkage hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PShrink {
    /// Weight of the raw predicted CSMF, in units of the target-set size.
    pub lambda: f64,
    /// Pseudo-count added to every cell of every misclassification row.
    pub delta: f64,
}

impl PShrink {
    pub const DEFAULT_LAMBDA: f64 = 1.0;
}

impl Default for PShrink {
    fn default() -> Self {
        Self {
            lambda: Self::DEFAULT_LAMBDA,
            delta: MShrink::DEFAULT_DELTA,
        }
    }
}

/// Shrinkage strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    MShrink(MShrink),
    PShrink(PShrink),
}

impl Method {
    pub fn mshrink(alpha: f64) -> Self {
        Method::MShrink(MShrink {
            alpha,
            ..MShrink::default()
        })
    }

    pub fn pshrink(lambda: f64) -> Self {
        Method::PShrink(PShrink {
            lambda,
            ..PShrink::default()
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::MShrink(_) => "mshrink",
            Method::PShrink(_) => "pshrink",
        }
    }

    /// The tuned shrinkage strength: `alpha` for mshrink, `lambda` for pshrink.
    pub fn strength(&self) -> f64 {
        match self {
            Method::MShrink(m) => m.alpha,
            Method::PShrink(p) => p.lambda,
        }
    }

    /// Strength of the no-extra-shrinkage default, preferred on WAIC ties.
    pub fn default_strength(&self) -> f64 {
        match self {
            Method::MShrink(_) => MShrink::DEFAULT_ALPHA,
            Method::PShrink(_) => PShrink::DEFAULT_LAMBDA,
        }
    }

    /// Returns a copy with the shrinkage strength replaced by `value`.
    pub fn with_strength(&self, value: f64) -> Self {
        match self {
            Method::MShrink(m) => Method::MShrink(MShrink {
                alpha: value,
                ..m.clone()
            }),
            Method::PShrink(p) => Method::PShrink(PShrink {
                lambda: value,
                ..p.clone()
            }),
        }
    }

    pub fn delta(&self) -> f64 {
        match self {
            Method::MShrink(m) => m.delta,
            Method::PShrink(p) => p.delta,
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::MShrink(MShrink::default())
    }
}

/// Full hyperparameter bundle handed to a sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    /// Symmetric Dirichlet prior on the CSMF.
    pub epsilon: f64,
    pub method: Method,
    /// Whether gold-standard causes also count toward the CSMF update.
    pub labeled_in_csmf: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            epsilon: 0.001,
            method: Method::default(),
            labeled_in_csmf: false,
        }
    }
}

impl Hyperparameters {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_labeled_in_csmf(mut self, include: bool) -> Self {
        self.labeled_in_csmf = include;
        self
    }

    /// Checks every value against `n_causes`.
    pub fn validate(&self, n_causes: usize) -> Result<()> {
        positive("epsilon", self.epsilon)?;
        match &self.method {
            Method::MShrink(m) => {
                positive("alpha", m.alpha)?;
                positive("beta", m.beta)?;
                positive("delta", m.delta)?;
                per_cause("tau", &m.tau, n_causes)?;
                per_cause("gamma_init", &m.gamma_init, n_causes)?;
            }
            Method::PShrink(p) => {
                positive("delta", p.delta)?;
                if !p.lambda.is_finite() || p.lambda < 0.0 {
                    return Err(CalibError::invalid(
                        "lambda",
                        format!("must be finite and non-negative, got {}", p.lambda),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn broadcast(values: &[f64], i: usize) -> f64 {
    if values.len() == 1 {
        values[0]
    } else {
        values[i]
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CalibError::invalid(
            name,
            format!("must be finite and positive, got {value}"),
        ))
    }
}

fn per_cause(name: &str, values: &[f64], n_causes: usize) -> Result<()> {
    if values.len() != 1 && values.len() != n_causes {
        return Err(CalibError::invalid(
            name,
            format!(
                "expected 1 or {n_causes} values, got {}",
                values.len()
            ),
        ));
    }
    values.iter().try_for_each(|&v| positive(name, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Hyperparameters::default().validate(4).is_ok());
        let hyper = Hyperparameters::default().with_method(Method::pshrink(1.0));
        assert!(hyper.validate(4).is_ok());
    }

    #[test]
    fn rejects_non_positive_values() {
        let hyper = Hyperparameters::default().with_epsilon(0.0);
        assert!(hyper.validate(3).is_err());

        let hyper = Hyperparameters::default().with_method(Method::mshrink(-1.0));
        let err = hyper.validate(3).unwrap_err();
        assert!(err.to_string().contains("alpha"), "{err}");

        let hyper = Hyperparameters::default().with_method(Method::pshrink(f64::NAN));
        assert!(hyper.validate(3).is_err());
    }

    #[test]
    fn per_cause_vectors_must_match_cause_count() {
        let method = Method::MShrink(MShrink {
            tau: vec![0.5, 0.5],
            ..MShrink::default()
        });
        let hyper = Hyperparameters::default().with_method(method);
        assert!(hyper.validate(3).is_err());
        assert!(hyper.validate(2).is_ok());
    }

    #[test]
    fn strength_round_trips_through_each_variant() {
        let m = Method::mshrink(5.0).with_strength(50.0);
        assert_eq!(m.strength(), 50.0);
        assert_eq!(m.name(), "mshrink");
        assert_eq!(m.default_strength(), MShrink::DEFAULT_ALPHA);

        let p = Method::pshrink(1.0).with_strength(0.1);
        assert_eq!(p.strength(), 0.1);
        assert_eq!(p.default_strength(), 1.0);
        assert_eq!(p.delta(), MShrink::DEFAULT_DELTA);
    }

    #[test]
    fn broadcast_reads_shared_or_per_cause_values() {
        let m = MShrink {
            gamma_init: vec![1.0, 2.0, 3.0],
            ..MShrink::default()
        };
        assert_eq!(m.gamma_init_at(2), 3.0);
        assert_eq!(m.tau_at(2), MShrink::DEFAULT_TAU);
    }
}
