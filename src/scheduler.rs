use std::fmt::Display;

use crate::measure::callback::{MeasureCallback, RoundView};
use crate::measure::{
    BuildInput, Builder, MeasureCandidate, Runner, RunnerFuture, RunnerInput, RunnerResult,
};
use crate::module::IrModule;
use crate::randstate::RandState;
use crate::search::{SearchError, SearchStrategy};
use crate::target::Target;
use crate::trace::Trace;

/// The tuning configuration of one task: one workload/target pair, its
/// design-space skeleton, its private random stream, and its trial budget.
/// Owned by the task scheduler; read-only to mutators and strategies.
pub struct TuneContext {
    pub task_name: String,
    pub mod_: IrModule,
    pub target: Target,
    /// The design-space skeleton whose replay yields the initial trace.
    pub space: Trace,
    pub rand: RandState,
    pub max_trials: usize,
    pub batch_size: usize,
    /// Early-stop criterion: the task completes once its best latency drops
    /// to or below this.
    pub latency_goal: Option<f64>,
}

impl TuneContext {
    pub fn new(
        task_name: impl Into<String>,
        mod_: IrModule,
        target: Target,
        space: Trace,
        rand: RandState,
        max_trials: usize,
    ) -> Self {
        TuneContext {
            task_name: task_name.into(),
            mod_,
            target,
            space,
            rand,
            max_trials,
            batch_size: 8,
            latency_goal: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_latency_goal(mut self, goal: f64) -> Self {
        self.latency_goal = Some(goal);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// The early-stop criterion was met.
    Completed,
    /// The trial budget is spent or the search space is dry.
    Exhausted,
}

impl TaskState {
    fn is_schedulable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Exhausted => "exhausted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct MeasuredRecord {
    pub round: usize,
    pub latency_seconds: Option<f64>,
    pub error: Option<String>,
}

struct Task {
    ctx: TuneContext,
    strategy: Box<dyn SearchStrategy>,
    state: TaskState,
    trials: usize,
    best_latency: Option<f64>,
    measured: Vec<MeasuredRecord>,
}

/// Final per-task summary returned by [TaskScheduler::tune].
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_name: String,
    pub state: TaskState,
    pub trials: usize,
    pub best_latency: Option<f64>,
}

/// Chooses which schedulable task runs the next round. Pluggable tie-break;
/// round-robin is the default.
pub trait TaskPolicy: Send {
    fn next_task(&mut self, states: &[TaskState]) -> Option<usize>;
}

#[derive(Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl TaskPolicy for RoundRobin {
    fn next_task(&mut self, states: &[TaskState]) -> Option<usize> {
        if states.is_empty() {
            return None;
        }
        for offset in 0..states.len() {
            let i = (self.cursor + offset) % states.len();
            if states[i].is_schedulable() {
                self.cursor = i + 1;
                return Some(i);
            }
        }
        None
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TuneError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("{stage} returned {got} results for {expected} candidates")]
    Misaligned {
        stage: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Coordinates concurrent tuning of multiple workloads.
///
/// Tasks advance cooperatively at round granularity: one task's round runs to
/// completion before the policy reconsiders task choice, and a task's
/// callbacks and strategy feedback always land before its next round's
/// candidates are requested.
pub struct TaskScheduler {
    tasks: Vec<Task>,
    builder: Box<dyn Builder>,
    runner: Box<dyn Runner>,
    callbacks: Vec<Box<dyn MeasureCallback>>,
    policy: Box<dyn TaskPolicy>,
    round: usize,
}

impl TaskScheduler {
    pub fn new(builder: Box<dyn Builder>, runner: Box<dyn Runner>) -> Self {
        TaskScheduler {
            tasks: Vec::new(),
            builder,
            runner,
            callbacks: Vec::new(),
            policy: Box::<RoundRobin>::default(),
            round: 0,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn TaskPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn MeasureCallback>) {
        self.callbacks.push(callback);
    }

    /// Registers a task; returns its id.
    pub fn add_task(&mut self, ctx: TuneContext, strategy: Box<dyn SearchStrategy>) -> usize {
        self.tasks.push(Task {
            ctx,
            strategy,
            state: TaskState::Pending,
            trials: 0,
            best_latency: None,
            measured: Vec::new(),
        });
        self.tasks.len() - 1
    }

    /// Runs rounds until every task is completed or exhausted. Only
    /// configuration errors abort the run; per-candidate build and run
    /// failures are recorded and tuning continues.
    pub fn tune(&mut self) -> Result<Vec<TaskReport>, TuneError> {
        loop {
            let states: Vec<TaskState> = self.tasks.iter().map(|t| t.state).collect();
            let Some(task_id) = self.policy.next_task(&states) else {
                break;
            };
            self.tick(task_id)?;
        }
        Ok(self.reports())
    }

    pub fn reports(&self) -> Vec<TaskReport> {
        self.tasks
            .iter()
            .map(|t| TaskReport {
                task_name: t.ctx.task_name.clone(),
                state: t.state,
                trials: t.trials,
                best_latency: t.best_latency,
            })
            .collect()
    }

    pub fn measured(&self, task_id: usize) -> &[MeasuredRecord] {
        &self.tasks[task_id].measured
    }

    fn tick(&mut self, task_id: usize) -> Result<(), TuneError> {
        let round = self.round;
        let task = &mut self.tasks[task_id];

        if task.state == TaskState::Pending {
            let child_rand = task.ctx.rand.fork();
            task.strategy.initialize(&task.ctx, child_rand)?;
            task.state = TaskState::Running;
            log::info!("task {} initialized", task.ctx.task_name);
        }

        let remaining = task.ctx.max_trials.saturating_sub(task.trials);
        if remaining == 0 {
            task.state = TaskState::Exhausted;
            return Ok(());
        }
        let want = remaining.min(task.ctx.batch_size);
        let Some(candidates) = task.strategy.generate_candidates(want) else {
            log::info!("task {} exhausted its search space", task.ctx.task_name);
            task.state = TaskState::Exhausted;
            return Ok(());
        };
        debug_assert!(!candidates.is_empty() && candidates.len() <= want);

        // Build the whole batch.
        let build_inputs: Vec<BuildInput> = candidates
            .iter()
            .map(|candidate| BuildInput {
                mod_: &task.ctx.mod_,
                target: &task.ctx.target,
                candidate,
            })
            .collect();
        let builder_results = self.builder.build(&build_inputs);
        if builder_results.len() != candidates.len() {
            return Err(TuneError::Misaligned {
                stage: "builder",
                expected: candidates.len(),
                got: builder_results.len(),
            });
        }

        // Run only the candidates that produced an artifact, then reassemble
        // results aligned with the candidate batch.
        let mut to_run = Vec::new();
        let mut run_slots: Vec<Option<usize>> = vec![None; candidates.len()];
        for (i, (candidate, build_result)) in candidates.iter().zip(&builder_results).enumerate() {
            if let Some(path) = &build_result.artifact_path {
                run_slots[i] = Some(to_run.len());
                to_run.push(RunnerInput {
                    artifact_path: path.clone(),
                    args_info: candidate.args_info.clone(),
                });
            }
        }
        let dispatched = to_run.len();
        let futures = self.runner.run(to_run);
        if futures.len() != dispatched {
            return Err(TuneError::Misaligned {
                stage: "runner",
                expected: dispatched,
                got: futures.len(),
            });
        }
        let mut completed: Vec<Option<RunnerResult>> =
            futures.into_iter().map(RunnerFuture::result).map(Some).collect();
        let runner_results: Vec<RunnerResult> = run_slots
            .iter()
            .zip(&builder_results)
            .map(|(slot, build_result)| match slot {
                Some(j) => completed[*j].take().unwrap_or_else(|| {
                    RunnerResult::err("runner result consumed twice")
                }),
                None => RunnerResult::err(format!(
                    "no artifact to run: {}",
                    build_result.error.as_deref().unwrap_or("build produced no path")
                )),
            })
            .collect();

        // Callbacks observe the full aligned triple, then the strategy.
        let view = RoundView {
            task_id,
            task_name: &task.ctx.task_name,
            round,
        };
        for callback in &mut self.callbacks {
            callback.apply(&view, &candidates, &builder_results, &runner_results);
        }
        task.strategy.notify_results(&candidates, &runner_results);

        task.trials += candidates.len();
        for result in &runner_results {
            if let Some(latency) = result.latency_seconds {
                if task.best_latency.map_or(true, |best| latency < best) {
                    task.best_latency = Some(latency);
                }
            }
            task.measured.push(MeasuredRecord {
                round,
                latency_seconds: result.latency_seconds,
                error: result.error.clone(),
            });
        }
        self.round += 1;

        match (task.ctx.latency_goal, task.best_latency) {
            (Some(goal), Some(best)) if best <= goal => {
                log::info!(
                    "task {} hit its latency goal ({:.3e}s <= {:.3e}s)",
                    task.ctx.task_name,
                    best,
                    goal
                );
                task.state = TaskState::Completed;
            }
            _ if task.trials >= task.ctx.max_trials => {
                task.state = TaskState::Exhausted;
            }
            _ => {}
        }
        Ok(())
    }
}
