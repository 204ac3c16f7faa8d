/*!
# Ensemble sampler over several prediction sources

Each individual carries one record per source (algorithm). Sources are
conditionally independent given the true cause, so the latent-cause update
multiplies the per-source likelihoods, each source keeps its own
misclassification matrix `M_k` (and under mshrink its own `gamma_k`), and the
CSMF update is the single-source one.

```rust
use calib_va::config::Hyperparameters;
use calib_va::data::{CauseSet, PredictionMatrix, Source};
use calib_va::ensemble::{EnsembleData, EnsembleSampler};

let causes = CauseSet::new(["A", "B"]).unwrap();
let source = |unlabeled: &[&str], labeled: &[&str]| Source {
    unlabeled: PredictionMatrix::from_labels(unlabeled, &causes, "va_unlabeled").unwrap(),
    labeled: PredictionMatrix::from_labels(labeled, &causes, "va_labeled").unwrap(),
};
let sources = vec![source(&["A", "B", "B"], &["A", "B"]), source(&["A", "A", "B"], &["B", "B"])];
let data = EnsembleData::new(causes.clone(), sources, &["A", "B"]).unwrap();

let chain = EnsembleSampler::new(data, Hyperparameters::default()).unwrap().run(20, 3).unwrap();
assert_eq!(chain.m.shape(), &[20, 2, 2, 2]);
```
*/

use std::sync::Arc;

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::chains::Chain;
use crate::config::{Hyperparameters, Method};
use crate::core::{run_chain, MarkovChain, RunOptions};
use crate::data::{
    resolve_gold_standard, validate_source, warn_missing_calibration, CalibrationData, CauseSet,
    PredictionMatrix, Source,
};
use crate::error::{CalibError, Result};
use crate::gibbs::{
    argmax_causes, count_matrix, pointwise_over_sources, resample_latent_causes,
    CalibrationSampler, ModelSpec, SweepState,
};

/// K prediction sources over the same individuals and gold standard.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleData {
    causes: CauseSet,
    sources: Vec<Source>,
    gold_standard: Vec<usize>,
}

impl EnsembleData {
    /// Every source must have the same unlabeled count as the first and one
    /// labeled record per gold-standard cause.
    pub fn new<S: AsRef<str>>(
        causes: CauseSet,
        sources: Vec<Source>,
        gold_standard: &[S],
    ) -> Result<Self> {
        let Some(first) = sources.first() else {
            return Err(CalibError::invalid(
                "sources",
                "need at least one prediction source",
            ));
        };
        let gold_standard = resolve_gold_standard(&causes, gold_standard)?;
        let n_unlabeled = first.unlabeled.n_individuals();
        for (k, source) in sources.iter().enumerate() {
            validate_source(
                &causes,
                source,
                gold_standard.len(),
                Some(n_unlabeled),
                &format!("source{k}"),
            )?;
        }
        warn_missing_calibration(&causes, &gold_standard);
        Ok(Self {
            causes,
            sources,
            gold_standard,
        })
    }

    pub fn causes(&self) -> &CauseSet {
        &self.causes
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn gold_standard(&self) -> &[usize] {
        &self.gold_standard
    }

    pub fn n_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn n_unlabeled(&self) -> usize {
        self.sources[0].unlabeled.n_individuals()
    }

    /// Mean of the per-source raw predicted CSMFs.
    pub fn raw_csmf(&self) -> Array1<f64> {
        let mut total = Array1::<f64>::zeros(self.causes.len());
        for source in &self.sources {
            total += &source.unlabeled.raw_csmf();
        }
        total / self.sources.len() as f64
    }

    fn unlabeled_records(&self) -> Vec<&PredictionMatrix> {
        self.sources.iter().map(|s| &s.unlabeled).collect()
    }
}

impl From<CalibrationData> for EnsembleData {
    fn from(data: CalibrationData) -> Self {
        Self {
            causes: data.causes().clone(),
            sources: vec![data.source().clone()],
            gold_standard: data.gold_standard().to_vec(),
        }
    }
}

/// Sampler over an [`EnsembleData`] set.
#[derive(Debug, Clone)]
pub struct EnsembleSampler {
    data: Arc<EnsembleData>,
    model: Arc<ModelSpec>,
}

impl EnsembleSampler {
    pub fn new(data: EnsembleData, hyper: Hyperparameters) -> Result<Self> {
        hyper.validate(data.causes().len())?;
        let model = ModelSpec::new(hyper, data.raw_csmf(), &data.gold_standard, data.n_unlabeled());
        Ok(Self {
            data: Arc::new(data),
            model: Arc::new(model),
        })
    }

    pub fn data(&self) -> &EnsembleData {
        &self.data
    }

    /// Runs one chain of `ndraws` sweeps seeded with `seed`.
    pub fn run(&self, ndraws: usize, seed: u64) -> Result<Chain> {
        let mut chain = self.chain(seed);
        let mut out = Chain::allocate(seed, ndraws, self)?;
        run_chain(&mut chain, ndraws, &RunOptions::default(), |i, s| out.record(i, s))?;
        Ok(out)
    }
}

impl CalibrationSampler for EnsembleSampler {
    type Chain = EnsembleChain;

    fn chain(&self, seed: u64) -> EnsembleChain {
        EnsembleChain::new(self.clone(), seed)
    }

    fn causes(&self) -> &CauseSet {
        self.data.causes()
    }

    fn hyperparameters(&self) -> &Hyperparameters {
        &self.model.hyper
    }

    fn n_sources(&self) -> usize {
        self.data.n_sources()
    }

    fn n_unlabeled(&self) -> usize {
        self.data.n_unlabeled()
    }

    fn with_method(&self, method: Method) -> Result<Self> {
        let hyper = self.model.hyper.clone().with_method(method);
        hyper.validate(self.model.n_causes)?;
        Ok(Self {
            data: self.data.clone(),
            model: Arc::new(ModelSpec {
                hyper,
                ..(*self.model).clone()
            }),
        })
    }

    fn uncalibrated(&self) -> Self {
        Self {
            data: self.data.clone(),
            model: Arc::new(ModelSpec {
                uncalibrated: true,
                ..(*self.model).clone()
            }),
        }
    }

    fn pointwise_log_likelihood(&self, p: ArrayView1<f64>, m: &[ArrayView2<f64>]) -> Array1<f64> {
        pointwise_over_sources(p, m, &self.data.unlabeled_records())
    }
}

/// One chain of an [`EnsembleSampler`].
#[derive(Debug, Clone)]
pub struct EnsembleChain {
    sampler: EnsembleSampler,
    state: SweepState,
    pub seed: u64,
    rng: SmallRng,
}

impl EnsembleChain {
    pub fn new(sampler: EnsembleSampler, seed: u64) -> Self {
        let model = &sampler.model;
        let k = sampler.data.n_sources();
        let gamma = model.initial_gamma(k);
        let m = (0..k)
            .map(|i| model.initial_misclassification(gamma.as_ref().map(|g| g.row(i))))
            .collect();
        let state = SweepState {
            p: model.initial_csmf(),
            m,
            gamma,
            z: argmax_causes(&sampler.data.sources[0].unlabeled),
            log_likelihood: f64::NAN,
            gamma_accepted: 0,
        };
        Self {
            sampler,
            state,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl MarkovChain for EnsembleChain {
    type State = SweepState;

    fn step(&mut self) -> Result<&SweepState> {
        let data = &self.sampler.data;
        let model = &self.sampler.model;
        let state = &mut self.state;
        let records = data.unlabeled_records();

        resample_latent_causes(&state.p, &state.m, &records, &mut state.z, &mut self.rng);

        state.gamma_accepted = 0;
        for (k, source) in data.sources.iter().enumerate() {
            let counts = count_matrix(source, &data.gold_standard, &state.z);
            state.m[k] = model.draw_misclassification(
                &counts,
                state.gamma.as_ref().map(|g| g.row(k)),
                &mut self.rng,
            )?;
            if let Some(gamma) = state.gamma.as_mut() {
                state.gamma_accepted +=
                    model.update_gamma(&state.m[k], gamma.row_mut(k), &mut self.rng);
            }
        }

        state.p = model.draw_csmf(&state.z, &mut self.rng)?;

        let m: Vec<ArrayView2<f64>> = state.m.iter().map(|mk| mk.view()).collect();
        state.log_likelihood = pointwise_over_sources(state.p.view(), &m, &records).sum();
        Ok(&self.state)
    }

    fn current_state(&self) -> &SweepState {
        &self.state
    }
}
