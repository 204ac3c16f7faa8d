//! Error type shared by every sampler entry point.

use thiserror::Error;

/// Errors raised while validating inputs or running chains.
///
/// Input problems are reported once, before the first sweep. A
/// [`CalibError::NumericDegeneracy`] means an internal accounting bug: every
/// Dirichlet draw is fed strictly positive pseudo-counts, so it should never
/// surface for valid inputs.
#[derive(Debug, Error)]
pub enum CalibError {
    #[error("invalid input for `{argument}`: {detail}")]
    InvalidInput { argument: String, detail: String },

    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error("sampling interrupted")]
    Interrupted,

    #[cfg(feature = "csv")]
    #[error("failed to write csv output: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalibError {
    pub(crate) fn invalid(argument: impl Into<String>, detail: impl Into<String>) -> Self {
        CalibError::InvalidInput {
            argument: argument.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CalibError>;
