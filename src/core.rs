//! Chain-generic plumbing: the [`MarkovChain`] trait and the loops that drive a
//! single chain, with optional progress reporting and cooperative interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::{CalibError, Result};

pub trait MarkovChain {
    type State;

    /// Does one full sweep of the chain, returning the new current state.
    fn step(&mut self) -> Result<&Self::State>;

    /// Get the current state without stepping.
    fn current_state(&self) -> &Self::State;
}

/// Options shared by every chain of a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Show one progress bar per chain.
    pub progress: bool,
    /// Checked once per sweep; when set the run fails with
    /// [`CalibError::Interrupted`].
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

const UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Runs `chain` for `n_steps` sweeps, handing every new state to `record`.
pub fn run_chain<M, F>(chain: &mut M, n_steps: usize, options: &RunOptions, mut record: F) -> Result<()>
where
    M: MarkovChain,
    F: FnMut(usize, &M::State),
{
    for i in 0..n_steps {
        if options.interrupted() {
            return Err(CalibError::Interrupted);
        }
        let state = chain.step()?;
        record(i, state);
    }
    Ok(())
}

/// Like [`run_chain`], updating `pb` roughly every 500 milliseconds.
pub fn run_chain_with_progress<M, F>(
    chain: &mut M,
    n_steps: usize,
    options: &RunOptions,
    pb: &ProgressBar,
    mut record: F,
) -> Result<()>
where
    M: MarkovChain,
    F: FnMut(usize, &M::State),
{
    let mut last_update = Instant::now();
    pb.set_length(n_steps as u64);

    for i in 0..n_steps {
        if options.interrupted() {
            pb.abandon_with_message("Interrupted");
            return Err(CalibError::Interrupted);
        }
        let state = chain.step()?;
        record(i, state);

        if last_update.elapsed() >= UPDATE_INTERVAL || i + 1 == n_steps {
            pb.set_position(i as u64 + 1);
            last_update = Instant::now();
        }
    }
    Ok(())
}

/// A `MultiProgress` plus the bar style used for every chain.
pub(crate) struct ChainProgress {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl ChainProgress {
    pub(crate) fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        Self {
            multi: MultiProgress::new(),
            style,
        }
    }

    pub(crate) fn bar(&self, chain: usize, n_steps: usize) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(n_steps as u64));
        pb.set_prefix(format!("Chain {chain}"));
        pb.set_style(self.style.clone());
        pb
    }
}
