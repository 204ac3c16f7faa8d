/*!
# CSV output for CSMF draws, summaries and tuning tables

Enable via the `csv` feature.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::chains::{kept_draws, Posterior};
use crate::csmf::CauseSummary;
use crate::error::Result;
use crate::tuning::Candidate;

/**
Saves the retained CSMF draws of every chain.

The file has a header row `chain,draw,<cause labels...>`, then one row per
retained draw, chain-major. `draw` is the index in the stored chain, so burn-in
and thinning stay visible.

```rust,no_run
use calib_va::chains::run_chains;
use calib_va::config::Hyperparameters;
use calib_va::core::RunOptions;
use calib_va::data::{CalibrationData, CauseSet, PredictionMatrix};
use calib_va::gibbs::GibbsSampler;
use calib_va::io::csv::save_csmf_draws;

let causes = CauseSet::new(["A", "B"]).unwrap();
let unlabeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_unlabeled").unwrap();
let labeled = PredictionMatrix::from_labels(&["A", "B"], &causes, "va_labeled").unwrap();
let data = CalibrationData::new(causes, unlabeled, labeled, &["A", "B"]).unwrap();
let sampler = GibbsSampler::new(data, Hyperparameters::default()).unwrap();
let posterior = run_chains(2, 1, &sampler, 100, &RunOptions::default()).unwrap();

save_csmf_draws(&posterior, 50, 5, "/tmp/csmf.csv").expect("Expecting saving draws to succeed");
```
*/
pub fn save_csmf_draws<P: AsRef<Path>>(
    posterior: &Posterior,
    burnin: usize,
    thin: usize,
    path: P,
) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);

    let mut header: Vec<String> = vec!["chain".to_string(), "draw".to_string()];
    header.extend(posterior.causes.labels().iter().cloned());
    wtr.write_record(&header)?;

    for (chain_idx, chain) in posterior.chains.iter().enumerate() {
        for draw in kept_draws(chain.n_draws(), burnin, thin)? {
            let mut row = vec![chain_idx.to_string(), draw.to_string()];
            row.extend(chain.p.row(draw).iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Saves per-cause summaries with header `cause,mean,median,lower,upper`.
pub fn save_summary<P: AsRef<Path>>(summary: &[CauseSummary], path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(["cause", "mean", "median", "lower", "upper"])?;
    for s in summary {
        wtr.write_record([
            s.cause.clone(),
            s.mean.to_string(),
            s.median.to_string(),
            s.lower.to_string(),
            s.upper.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Saves a tuning table with header `value,waic,lppd,p_waic,max_rhat,warnings`.
/// Warnings are joined with `; `.
pub fn save_tuning_table<P: AsRef<Path>>(table: &[Candidate], path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(["value", "waic", "lppd", "p_waic", "max_rhat", "warnings"])?;
    for c in table {
        let warnings: Vec<String> = c.warnings.iter().map(ToString::to_string).collect();
        wtr.write_record([
            c.value.to_string(),
            c.waic.waic.to_string(),
            c.waic.lppd.to_string(),
            c.waic.p_waic.to_string(),
            c.max_rhat.to_string(),
            warnings.join("; "),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
