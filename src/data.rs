/*!
# Inputs: causes, prediction records and calibration data

Every prediction record is held as a length-`C` probability vector. Categorical
predictions become one-hot rows and remember their label index, so the sampler
can take the cheap column lookup instead of a dot product.

```rust
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};

let causes = CauseSet::new(["A", "B", "C"]).unwrap();
let unlabeled = PredictionMatrix::from_labels(&["A", "A", "C"], &causes, "va_unlabeled").unwrap();
let labeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_labeled").unwrap();
let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "C"]).unwrap();
assert_eq!(data.n_unlabeled(), 3);
```
*/

use std::collections::HashMap;

use log::warn;
use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{CalibError, Result};

/// Absolute deviation from 1 that is silently renormalised.
pub const RENORMALIZE_EPSILON: f64 = 1e-9;

/// Default absolute deviation from 1 above which a probability row is rejected.
pub const DEFAULT_PROB_TOLERANCE: f64 = 1e-3;

/// An ordered set of unique cause labels. Position `i` is parameter `p_i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CauseSet {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl CauseSet {
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.len() < 2 {
            return Err(CalibError::invalid(
                "causes",
                format!("need at least 2 causes, got {}", labels.len()),
            ));
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(CalibError::invalid(
                    "causes",
                    format!("duplicate cause label {label:?}"),
                ));
            }
        }
        Ok(Self { labels, index })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn label(&self, i: usize) -> &str {
        &self.labels[i]
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Resolves `label`, naming `argument` and `row` in the error.
    pub fn resolve(&self, label: &str, argument: &str, row: usize) -> Result<usize> {
        self.index_of(label).ok_or_else(|| {
            CalibError::invalid(
                argument,
                format!("row {row}: cause {label:?} is not in the cause set"),
            )
        })
    }
}

/// One algorithm's output for one individual.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Label(String),
    Probabilities(Vec<f64>),
}

impl From<&str> for Prediction {
    fn from(label: &str) -> Self {
        Prediction::Label(label.to_string())
    }
}

impl From<Vec<f64>> for Prediction {
    fn from(probs: Vec<f64>) -> Self {
        Prediction::Probabilities(probs)
    }
}

/// Validated prediction records for a set of individuals (`n x C`).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionMatrix {
    probs: Array2<f64>,
    hard: Vec<Option<usize>>,
}

impl PredictionMatrix {
    /// Builds a matrix from mixed categorical/probabilistic records.
    pub fn from_predictions(
        predictions: &[Prediction],
        causes: &CauseSet,
        tolerance: f64,
        argument: &str,
    ) -> Result<Self> {
        check_tolerance(tolerance)?;
        let c = causes.len();
        let mut probs = Array2::<f64>::zeros((predictions.len(), c));
        let mut hard = Vec::with_capacity(predictions.len());
        for (j, prediction) in predictions.iter().enumerate() {
            match prediction {
                Prediction::Label(label) => {
                    let k = causes.resolve(label, argument, j)?;
                    probs[[j, k]] = 1.0;
                    hard.push(Some(k));
                }
                Prediction::Probabilities(row) => {
                    let row = normalize_row(ArrayView1::from(row.as_slice()), c, tolerance, argument, j)?;
                    probs.row_mut(j).assign(&row);
                    hard.push(None);
                }
            }
        }
        Ok(Self { probs, hard })
    }

    /// Builds a matrix of categorical predictions.
    pub fn from_labels<S: AsRef<str>>(
        labels: &[S],
        causes: &CauseSet,
        argument: &str,
    ) -> Result<Self> {
        let mut probs = Array2::<f64>::zeros((labels.len(), causes.len()));
        let mut hard = Vec::with_capacity(labels.len());
        for (j, label) in labels.iter().enumerate() {
            let k = causes.resolve(label.as_ref(), argument, j)?;
            probs[[j, k]] = 1.0;
            hard.push(Some(k));
        }
        Ok(Self { probs, hard })
    }

    /// Builds a matrix of probabilistic predictions, one row per individual.
    pub fn from_probabilities(
        probs: &Array2<f64>,
        causes: &CauseSet,
        tolerance: f64,
        argument: &str,
    ) -> Result<Self> {
        check_tolerance(tolerance)?;
        if probs.ncols() != causes.len() {
            return Err(CalibError::invalid(
                argument,
                format!(
                    "expected {} columns (one per cause), got {}",
                    causes.len(),
                    probs.ncols()
                ),
            ));
        }
        let mut out = Array2::<f64>::zeros(probs.raw_dim());
        for (j, row) in probs.axis_iter(Axis(0)).enumerate() {
            let row = normalize_row(row, causes.len(), tolerance, argument, j)?;
            out.row_mut(j).assign(&row);
        }
        Ok(Self {
            probs: out,
            hard: vec![None; probs.nrows()],
        })
    }

    pub fn n_individuals(&self) -> usize {
        self.probs.nrows()
    }

    pub fn n_causes(&self) -> usize {
        self.probs.ncols()
    }

    pub fn row(&self, j: usize) -> ArrayView1<'_, f64> {
        self.probs.row(j)
    }

    /// Label index of a categorical record, `None` for a probability vector.
    pub fn hard_label(&self, j: usize) -> Option<usize> {
        self.hard[j]
    }

    pub fn probabilities(&self) -> &Array2<f64> {
        &self.probs
    }

    /// Raw (uncalibrated) predicted CSMF: the column means of the records.
    pub fn raw_csmf(&self) -> Array1<f64> {
        self.probs
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::from_elem(self.n_causes(), 1.0 / self.n_causes() as f64))
    }
}

fn check_tolerance(tolerance: f64) -> Result<()> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(CalibError::invalid(
            "tolerance",
            format!("must be finite and non-negative, got {tolerance}"),
        ));
    }
    Ok(())
}

fn normalize_row(
    row: ArrayView1<'_, f64>,
    n_causes: usize,
    tolerance: f64,
    argument: &str,
    j: usize,
) -> Result<Array1<f64>> {
    if row.len() != n_causes {
        return Err(CalibError::invalid(
            argument,
            format!("row {j}: expected {n_causes} probabilities, got {}", row.len()),
        ));
    }
    if let Some(bad) = row.iter().find(|x| !x.is_finite() || **x < 0.0) {
        return Err(CalibError::invalid(
            argument,
            format!("row {j}: probabilities must be finite and non-negative, found {bad}"),
        ));
    }
    let sum: f64 = row.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Err(CalibError::invalid(
            argument,
            format!("row {j}: probabilities sum to {sum}"),
        ));
    }
    let deviation = (sum - 1.0).abs();
    if deviation > tolerance {
        return Err(CalibError::invalid(
            argument,
            format!("row {j}: probabilities sum to {sum}, outside tolerance {tolerance}"),
        ));
    }
    let row = row.to_owned();
    if deviation > RENORMALIZE_EPSILON {
        warn!("{argument} row {j}: renormalising probabilities that sum to {sum}");
        return Ok(row / sum);
    }
    Ok(row)
}

/// One prediction source: its records for the target and calibration sets.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub unlabeled: PredictionMatrix,
    pub labeled: PredictionMatrix,
}

/// Single-algorithm input: target predictions plus the labeled calibration set.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationData {
    causes: CauseSet,
    source: Source,
    gold_standard: Vec<usize>,
}

impl CalibrationData {
    pub fn new<S: AsRef<str>>(
        causes: CauseSet,
        unlabeled: PredictionMatrix,
        labeled: PredictionMatrix,
        gold_standard: &[S],
    ) -> Result<Self> {
        let gold_standard = resolve_gold_standard(&causes, gold_standard)?;
        let source = Source { unlabeled, labeled };
        validate_source(&causes, &source, gold_standard.len(), None, "va")?;
        warn_missing_calibration(&causes, &gold_standard);
        Ok(Self {
            causes,
            source,
            gold_standard,
        })
    }

    pub fn causes(&self) -> &CauseSet {
        &self.causes
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn gold_standard(&self) -> &[usize] {
        &self.gold_standard
    }

    pub fn n_unlabeled(&self) -> usize {
        self.source.unlabeled.n_individuals()
    }

    pub fn n_labeled(&self) -> usize {
        self.gold_standard.len()
    }
}

pub(crate) fn resolve_gold_standard<S: AsRef<str>>(
    causes: &CauseSet,
    gold_standard: &[S],
) -> Result<Vec<usize>> {
    if gold_standard.is_empty() {
        return Err(CalibError::invalid(
            "gold_standard",
            "the calibration set has no individuals",
        ));
    }
    gold_standard
        .iter()
        .enumerate()
        .map(|(j, label)| causes.resolve(label.as_ref(), "gold_standard", j))
        .collect()
}

/// Checks one source against the cause set, the gold standard and (for
/// ensembles) the unlabeled count shared by every source.
pub(crate) fn validate_source(
    causes: &CauseSet,
    source: &Source,
    n_labeled: usize,
    n_unlabeled: Option<usize>,
    name: &str,
) -> Result<()> {
    for (matrix, role) in [(&source.unlabeled, "unlabeled"), (&source.labeled, "labeled")] {
        if matrix.n_causes() != causes.len() {
            return Err(CalibError::invalid(
                format!("{name}_{role}"),
                format!(
                    "records have {} columns but there are {} causes",
                    matrix.n_causes(),
                    causes.len()
                ),
            ));
        }
    }
    if source.unlabeled.n_individuals() == 0 {
        return Err(CalibError::invalid(
            format!("{name}_unlabeled"),
            "the target set has no individuals",
        ));
    }
    if source.labeled.n_individuals() != n_labeled {
        return Err(CalibError::invalid(
            format!("{name}_labeled"),
            format!(
                "{} labeled records but {} gold-standard causes",
                source.labeled.n_individuals(),
                n_labeled
            ),
        ));
    }
    if let Some(expected) = n_unlabeled {
        if source.unlabeled.n_individuals() != expected {
            return Err(CalibError::invalid(
                format!("{name}_unlabeled"),
                format!(
                    "{} unlabeled records but the first source has {}",
                    source.unlabeled.n_individuals(),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

pub(crate) fn warn_missing_calibration(causes: &CauseSet, gold_standard: &[usize]) {
    let mut seen = vec![false; causes.len()];
    gold_standard.iter().for_each(|&g| seen[g] = true);
    for (i, _) in seen.iter().enumerate().filter(|(_, s)| !**s) {
        warn!(
            "cause {:?} has no calibration individuals; its misclassification row follows the prior",
            causes.label(i)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn abc() -> CauseSet {
        CauseSet::new(["A", "B", "C"]).unwrap()
    }

    #[test]
    fn cause_set_rejects_short_and_duplicate_labels() {
        assert!(matches!(
            CauseSet::new(["A"]),
            Err(CalibError::InvalidInput { .. })
        ));
        assert!(matches!(
            CauseSet::new(Vec::<String>::new()),
            Err(CalibError::InvalidInput { .. })
        ));
        assert!(CauseSet::new(["A", "B", "A"]).is_err());
        let causes = abc();
        assert_eq!(causes.index_of("C"), Some(2));
        assert_eq!(causes.label(1), "B");
    }

    #[test]
    fn unknown_label_names_argument_and_row() {
        let err = PredictionMatrix::from_labels(&["A", "Z"], &abc(), "va_unlabeled").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("va_unlabeled"), "{msg}");
        assert!(msg.contains("row 1"), "{msg}");
    }

    #[test]
    fn probabilities_are_renormalised_within_tolerance() {
        let preds = vec![
            Prediction::Probabilities(vec![0.5, 0.3, 0.2005]),
            Prediction::from("B"),
        ];
        let m = PredictionMatrix::from_predictions(&preds, &abc(), 1e-3, "va").unwrap();
        assert_abs_diff_eq!(m.row(0).sum(), 1.0, epsilon = 1e-12);
        assert_eq!(m.hard_label(0), None);
        assert_eq!(m.hard_label(1), Some(1));
    }

    #[test]
    fn probabilities_outside_tolerance_are_rejected() {
        let probs = arr2(&[[0.5, 0.3, 0.1]]);
        let err = PredictionMatrix::from_probabilities(&probs, &abc(), 1e-3, "va").unwrap_err();
        assert!(matches!(err, CalibError::InvalidInput { .. }));
        let negative = arr2(&[[1.2, -0.2, 0.0]]);
        assert!(PredictionMatrix::from_probabilities(&negative, &abc(), 1e-3, "va").is_err());
    }

    #[test]
    fn tolerance_must_be_finite_and_non_negative() {
        let probs = arr2(&[[0.2, 0.2, 0.2]]);
        for tolerance in [f64::NAN, f64::INFINITY, -1e-3] {
            let err = PredictionMatrix::from_probabilities(&probs, &abc(), tolerance, "va").unwrap_err();
            assert!(
                matches!(err, CalibError::InvalidInput { ref argument, .. } if argument == "tolerance"),
                "{err}"
            );
        }
        let preds = vec![Prediction::Probabilities(vec![0.2, 0.2, 0.2])];
        assert!(PredictionMatrix::from_predictions(&preds, &abc(), f64::NAN, "va").is_err());
    }

    #[test]
    fn all_zero_row_is_rejected_even_with_a_wide_tolerance() {
        let zeros = arr2(&[[0.5, 0.25, 0.25], [0.0, 0.0, 0.0]]);
        let err = PredictionMatrix::from_probabilities(&zeros, &abc(), 2.0, "va").unwrap_err();
        assert!(
            matches!(err, CalibError::InvalidInput { ref argument, .. } if argument == "va"),
            "{err}"
        );
        assert!(err.to_string().contains("row 1"), "{err}");
        let wide = PredictionMatrix::from_probabilities(&arr2(&[[0.2, 0.2, 0.2]]), &abc(), 2.0, "va").unwrap();
        assert_abs_diff_eq!(wide.row(0).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn raw_csmf_is_column_mean() {
        let m = PredictionMatrix::from_labels(&["A", "A", "B", "C"], &abc(), "va").unwrap();
        let q = m.raw_csmf();
        assert_abs_diff_eq!(q[0], 0.5);
        assert_abs_diff_eq!(q[1], 0.25);
        assert_abs_diff_eq!(q[2], 0.25);
    }

    #[test]
    fn calibration_data_checks_counts_and_gold_standard() {
        let causes = abc();
        let unlabeled = PredictionMatrix::from_labels(&["A"], &causes, "va_unlabeled").unwrap();
        let labeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_labeled").unwrap();
        assert!(CalibrationData::new(causes.clone(), unlabeled.clone(), labeled.clone(), &["A"]).is_err());
        assert!(CalibrationData::new(causes.clone(), unlabeled.clone(), labeled.clone(), &["A", "Q"]).is_err());
        assert!(CalibrationData::new(causes.clone(), unlabeled.clone(), labeled.clone(), &Vec::<&str>::new()).is_err());
        let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "C"]).unwrap();
        assert_eq!(data.gold_standard(), &[0, 2]);
        assert_eq!(data.n_labeled(), 2);
    }
}
