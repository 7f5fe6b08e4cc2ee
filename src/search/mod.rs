pub mod mutator;

use std::collections::HashSet;

use crate::arginfo::{ArgInfo, ArgInfoError};
use crate::measure::{MeasureCandidate, RunnerResult};
use crate::randstate::RandState;
use crate::sched::{Schedule, ScheduleError};
use crate::scheduler::TuneContext;
use crate::trace::Trace;

use self::mutator::Mutator;

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    ArgInfo(#[from] ArgInfoError),
}

/// Per-task candidate generation. The scheduler drives one strategy instance
/// per task: `initialize` once, then alternating `generate_candidates` /
/// `notify_results` rounds until the strategy reports exhaustion.
pub trait SearchStrategy: Send {
    /// Binds the strategy to its task. Failures here are configuration
    /// errors and abort the whole tuning run.
    fn initialize(&mut self, ctx: &TuneContext, rand: RandState) -> Result<(), SearchError>;

    /// Proposes up to `n` fresh candidates, or `None` when the reachable
    /// space is exhausted.
    fn generate_candidates(&mut self, n: usize) -> Option<Vec<MeasureCandidate>>;

    /// Feeds one round's measurements back, aligned with the candidates the
    /// strategy proposed. Called before the next `generate_candidates` for
    /// the same task.
    fn notify_results(&mut self, candidates: &[MeasureCandidate], results: &[RunnerResult]);
}

/// Stochastic local search: keep the best measured traces, mutate one
/// decision of a parent per proposal, and reject duplicates.
pub struct MutationSearch {
    mutators: Vec<(Box<dyn Mutator>, f64)>,
    max_attempts_per_candidate: usize,
    /// Probability of mutating the initial trace instead of the incumbent
    /// best, to keep exploring away from the current optimum.
    epsilon: f64,
    population_cap: usize,
    state: Option<SearchState>,
}

struct SearchState {
    rand: RandState,
    args_info: Vec<ArgInfo>,
    initial: Trace,
    initial_measured: bool,
    /// Measured traces, best (lowest latency) first.
    population: Vec<(Trace, f64)>,
    seen: HashSet<String>,
}

impl MutationSearch {
    pub fn new(mutators: Vec<(Box<dyn Mutator>, f64)>) -> Self {
        MutationSearch {
            mutators,
            max_attempts_per_candidate: 16,
            epsilon: 0.2,
            population_cap: 32,
            state: None,
        }
    }

    fn propose(&mut self, out: &mut Vec<MeasureCandidate>) -> bool {
        let Some(state) = self.state.as_mut() else {
            return false;
        };
        for _ in 0..self.max_attempts_per_candidate {
            let parent = if state.population.is_empty() || state.rand.sample_f64() < self.epsilon {
                state.initial.clone()
            } else {
                state.population[0].0.clone()
            };
            let weights: Vec<f64> = self.mutators.iter().map(|(_, w)| *w).collect();
            let which = state.rand.sample_weighted(&weights);
            let Some(mutated) = self.mutators[which].0.apply(&parent, &mut state.rand) else {
                continue;
            };
            if !state.seen.insert(mutated.to_json().to_string()) {
                log::trace!("{} proposed a duplicate trace", self.mutators[which].0.name());
                continue;
            }
            out.push(MeasureCandidate {
                trace: mutated,
                args_info: state.args_info.clone(),
            });
            return true;
        }
        false
    }
}

impl Default for MutationSearch {
    fn default() -> Self {
        MutationSearch::new(mutator::standard_mutators())
    }
}

/// Cloning yields an uninitialized strategy with its own mutator copies,
/// suitable for handing to another task; measured state is not shared.
impl Clone for MutationSearch {
    fn clone(&self) -> Self {
        MutationSearch {
            mutators: self
                .mutators
                .iter()
                .map(|(m, w)| (m.clone_boxed(), *w))
                .collect(),
            max_attempts_per_candidate: self.max_attempts_per_candidate,
            epsilon: self.epsilon,
            population_cap: self.population_cap,
            state: None,
        }
    }
}

impl SearchStrategy for MutationSearch {
    fn initialize(&mut self, ctx: &TuneContext, mut rand: RandState) -> Result<(), SearchError> {
        for (m, _) in &mut self.mutators {
            m.initialize_with_tune_context(ctx);
        }
        let mut sch = Schedule::new(&ctx.mod_, rand.fork())?;
        let initial = ctx.space.apply_to_schedule(&mut sch, false, None)?;
        let args_info = ArgInfo::from_entry_func(&ctx.mod_, true)?;
        let mut seen = HashSet::new();
        seen.insert(initial.to_json().to_string());
        self.state = Some(SearchState {
            rand,
            args_info,
            initial,
            initial_measured: false,
            population: Vec::new(),
            seen,
        });
        Ok(())
    }

    fn generate_candidates(&mut self, n: usize) -> Option<Vec<MeasureCandidate>> {
        let mut out = Vec::with_capacity(n);
        if let Some(state) = self.state.as_mut() {
            if !state.initial_measured {
                state.initial_measured = true;
                out.push(MeasureCandidate {
                    trace: state.initial.clone(),
                    args_info: state.args_info.clone(),
                });
            }
        } else {
            return None;
        }
        while out.len() < n {
            if !self.propose(&mut out) {
                break;
            }
        }
        if out.is_empty() {
            log::debug!("search space exhausted; no fresh candidate found");
            return None;
        }
        Some(out)
    }

    fn notify_results(&mut self, candidates: &[MeasureCandidate], results: &[RunnerResult]) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        for (candidate, result) in candidates.iter().zip(results) {
            match result.latency_seconds {
                Some(latency) => {
                    state.population.push((candidate.trace.clone(), latency));
                }
                None => {
                    log::debug!(
                        "candidate rejected by measurement: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
        state
            .population
            .sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        state.population.truncate(self.population_cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BlockDef, IrModule, Param, PrimFunc};
    use crate::target::Target;
    use crate::workload;
    use smallvec::smallvec;

    fn ctx(mod_: IrModule) -> TuneContext {
        let space = workload::schedule_skeleton(&mod_).unwrap();
        TuneContext::new(
            "t",
            mod_,
            Target::new("cpu").unwrap(),
            space,
            RandState::new(0),
            64,
        )
    }

    #[test]
    fn test_first_round_measures_initial_trace() {
        let mut search = MutationSearch::default();
        search
            .initialize(&ctx(workload::matmul(16, 16, 16)), RandState::new(1))
            .unwrap();
        let candidates = search.generate_candidates(4).unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.len() <= 4);
    }

    #[test]
    fn test_candidates_within_a_run_are_unique() {
        let mut search = MutationSearch::default();
        search
            .initialize(&ctx(workload::matmul(16, 16, 16)), RandState::new(1))
            .unwrap();
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let Some(candidates) = search.generate_candidates(4) else {
                break;
            };
            for c in &candidates {
                assert!(seen.insert(c.trace.to_json().to_string()));
            }
            let results: Vec<_> = (0..candidates.len())
                .map(|i| RunnerResult::ok(1e-3 * (i + 1) as f64))
                .collect();
            search.notify_results(&candidates, &results);
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let gen = || {
            let mut search = MutationSearch::default();
            search
                .initialize(&ctx(workload::matmul(16, 16, 16)), RandState::new(5))
                .unwrap();
            search
                .generate_candidates(8)
                .unwrap()
                .iter()
                .map(|c| c.trace.to_json().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(gen(), gen());
    }

    #[test]
    fn test_frozen_space_exhausts_after_initial() {
        // One block with a unit loop: every decision space is a singleton,
        // so no mutation can produce a fresh trace.
        let mod_ = IrModule::new(vec![(
            "main".to_owned(),
            PrimFunc {
                params: Vec::<Param>::new(),
                is_entry: true,
                body: vec![BlockDef {
                    name: "only".to_owned(),
                    loop_extents: smallvec![1],
                    layout_rewrite_preproc: false,
                }],
            },
        )]);
        let mut search = MutationSearch::default();
        search.initialize(&ctx(mod_), RandState::new(2)).unwrap();
        let first = search.generate_candidates(4).unwrap();
        assert_eq!(first.len(), 1);
        search.notify_results(&first, &[RunnerResult::ok(1.0)]);
        assert!(search.generate_candidates(4).is_none());
    }

    #[test]
    fn test_failed_measurements_do_not_enter_population() {
        let mut search = MutationSearch::default();
        search
            .initialize(&ctx(workload::matmul(16, 16, 16)), RandState::new(1))
            .unwrap();
        let candidates = search.generate_candidates(2).unwrap();
        let results: Vec<_> = candidates
            .iter()
            .map(|_| RunnerResult::err("segfault"))
            .collect();
        search.notify_results(&candidates, &results);
        assert!(search.state.as_ref().unwrap().population.is_empty());
    }
}
