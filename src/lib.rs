//! Bayesian calibration of verbal-autopsy cause-of-death predictions.
//!
//! A small gold-standard calibration set estimates how an algorithm
//! misclassifies causes; a Gibbs sampler then infers the cause-specific
//! mortality fractions (CSMF) of a large unlabeled target set jointly with that
//! misclassification. See [`gibbs`] for the single-algorithm sampler,
//! [`ensemble`] for several algorithms, [`chains`] for running chains and
//! [`tuning`] for choosing the shrinkage strength.

pub mod chains;
pub mod config;
pub mod core;
pub mod csmf;
pub mod data;
pub mod distributions;
pub mod ensemble;
pub mod error;
pub mod gibbs;
pub mod io;
pub mod metropolis_hastings;
pub mod stats;
pub mod tuning;

pub use crate::chains::{extract_csmf, run_chains, Chain, CsmfDraws, Posterior};
pub use crate::config::{Hyperparameters, MShrink, Method, PShrink};
pub use crate::core::RunOptions;
pub use crate::data::{CalibrationData, CauseSet, Prediction, PredictionMatrix, Source};
pub use crate::ensemble::{EnsembleData, EnsembleSampler};
pub use crate::error::{CalibError, Result};
pub use crate::gibbs::{CalibrationSampler, GibbsSampler};
pub use crate::tuning::{tune, TuneConfig, TuneInput, TuneResult};
