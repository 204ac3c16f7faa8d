//! Per-cause summaries of retained CSMF draws.

use ndarray::ArrayView1;

use crate::chains::CsmfDraws;
use crate::error::{CalibError, Result};

/// Posterior summary of one cause's mortality fraction.
#[derive(Debug, Clone, PartialEq)]
pub struct CauseSummary {
    pub cause: String,
    pub mean: f64,
    pub median: f64,
    /// Lower credible bound.
    pub lower: f64,
    /// Upper credible bound.
    pub upper: f64,
}

/// Mean, median and central 95% interval of every cause.
pub fn summarize(draws: &CsmfDraws) -> Result<Vec<CauseSummary>> {
    summarize_with(draws, 0.025, 0.975)
}

/// Like [`summarize`] with the interval bounds given as probabilities.
pub fn summarize_with(draws: &CsmfDraws, lower: f64, upper: f64) -> Result<Vec<CauseSummary>> {
    if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) || lower > upper {
        return Err(CalibError::invalid(
            "quantiles",
            format!("need 0 <= lower <= upper <= 1, got {lower} and {upper}"),
        ));
    }
    if draws.n_draws() == 0 {
        return Err(CalibError::invalid("draws", "no retained draws"));
    }
    Ok(draws
        .pairs()
        .map(|(cause, values)| {
            let sorted = sorted(values);
            CauseSummary {
                cause: cause.to_string(),
                mean: values.sum() / values.len() as f64,
                median: quantile(&sorted, 0.5),
                lower: quantile(&sorted, lower),
                upper: quantile(&sorted, upper),
            }
        })
        .collect())
}

fn sorted(values: ArrayView1<f64>) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

/// Linear interpolation between the order statistics around `q * (n - 1)`.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn draws() -> CsmfDraws {
        // Cause A takes 0.00, 0.01, ..., 1.00; cause B the complement.
        let values = Array2::from_shape_fn((101, 2), |(i, c)| {
            let a = i as f64 / 100.0;
            if c == 0 {
                a
            } else {
                1.0 - a
            }
        });
        CsmfDraws {
            causes: vec!["A".into(), "B".into()],
            values,
        }
    }

    #[test]
    fn summary_of_uniform_grid() {
        let summary = summarize(&draws()).unwrap();
        assert_eq!(summary.len(), 2);
        let a = &summary[0];
        assert_eq!(a.cause, "A");
        assert_abs_diff_eq!(a.mean, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(a.median, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(a.lower, 0.025, epsilon = 1e-12);
        assert_abs_diff_eq!(a.upper, 0.975, epsilon = 1e-12);
        assert_abs_diff_eq!(summary[1].lower, 0.025, epsilon = 1e-12);
    }

    #[test]
    fn quantile_interpolates_between_order_statistics() {
        let s = [1.0, 2.0, 4.0];
        assert_abs_diff_eq!(quantile(&s, 0.0), 1.0);
        assert_abs_diff_eq!(quantile(&s, 0.25), 1.5);
        assert_abs_diff_eq!(quantile(&s, 0.75), 3.0);
        assert_abs_diff_eq!(quantile(&s, 1.0), 4.0);
        assert_abs_diff_eq!(quantile(&[7.0], 0.3), 7.0);
    }

    #[test]
    fn custom_interval_and_bad_bounds() {
        let summary = summarize_with(&draws(), 0.1, 0.9).unwrap();
        assert_abs_diff_eq!(summary[0].lower, 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(summary[0].upper, 0.9, epsilon = 1e-12);
        assert!(summarize_with(&draws(), 0.9, 0.1).is_err());
        assert!(summarize_with(&draws(), -0.1, 0.9).is_err());
        let empty = CsmfDraws {
            causes: vec!["A".into(), "B".into()],
            values: Array2::zeros((0, 2)),
        };
        assert!(summarize(&empty).is_err());
    }
}
