pub mod callback;
pub mod local;

use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::arginfo::ArgInfo;
use crate::module::IrModule;
use crate::target::Target;
use crate::trace::Trace;

/// A fully resolved, schedulable variant plus the descriptors of the runtime
/// inputs it expects. Produced once per search proposal and consumed exactly
/// once by a build/run round.
#[derive(Debug, Clone)]
pub struct MeasureCandidate {
    pub trace: Trace,
    pub args_info: Vec<ArgInfo>,
}

/// Outcome of compiling one candidate. Exactly one of the two fields is
/// populated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BuilderResult {
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Outcome of measuring one candidate. Exactly one of the two fields is
/// populated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunnerResult {
    pub latency_seconds: Option<f64>,
    pub error: Option<String>,
}

impl BuilderResult {
    pub fn ok(artifact_path: PathBuf) -> Self {
        BuilderResult {
            artifact_path: Some(artifact_path),
            error: None,
        }
    }

    pub fn err(error: impl ToString) -> Self {
        BuilderResult {
            artifact_path: None,
            error: Some(error.to_string()),
        }
    }
}

impl RunnerResult {
    pub fn ok(latency_seconds: f64) -> Self {
        RunnerResult {
            latency_seconds: Some(latency_seconds),
            error: None,
        }
    }

    pub fn err(error: impl ToString) -> Self {
        RunnerResult {
            latency_seconds: None,
            error: Some(error.to_string()),
        }
    }
}

/// What the external toolchain needs to compile one candidate.
pub struct BuildInput<'a> {
    pub mod_: &'a IrModule,
    pub target: &'a Target,
    pub candidate: &'a MeasureCandidate,
}

/// What the external executor needs to measure one built candidate: the
/// compiled artifact plus the descriptors from which measurement inputs are
/// synthesized.
#[derive(Debug, Clone)]
pub struct RunnerInput {
    pub artifact_path: PathBuf,
    pub args_info: Vec<ArgInfo>,
}

/// An externally supplied compilation capability, invoked once per round with
/// the whole candidate batch. The result array is positionally aligned with
/// the input array.
pub trait Builder: Send {
    fn build(&self, inputs: &[BuildInput]) -> Vec<BuilderResult>;
}

/// An externally supplied measurement capability. Returns one future per
/// input, positionally aligned; results are collected at the round boundary.
/// Execution may complete out-of-process, so completion is a channel, not a
/// return value.
pub trait Runner: Send {
    fn run(&self, inputs: Vec<RunnerInput>) -> Vec<RunnerFuture>;
}

/// A pending measurement. Dropping the sender without fulfilling it yields an
/// error result rather than a hang.
pub struct RunnerFuture(Receiver<RunnerResult>);

impl RunnerFuture {
    /// Creates an unfulfilled future and the sender used to fulfill it.
    pub fn pending() -> (Sender<RunnerResult>, RunnerFuture) {
        let (tx, rx) = bounded(1);
        (tx, RunnerFuture(rx))
    }

    /// An already-fulfilled future.
    pub fn ready(result: RunnerResult) -> RunnerFuture {
        let (tx, fut) = RunnerFuture::pending();
        // The channel has capacity 1 and we hold the only sender.
        let _ = tx.send(result);
        fut
    }

    /// Blocks until the measurement completes.
    pub fn result(self) -> RunnerResult {
        self.0
            .recv()
            .unwrap_or_else(|_| RunnerResult::err("runner dropped without reporting a result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_future_resolves() {
        let fut = RunnerFuture::ready(RunnerResult::ok(1.5e-3));
        assert_eq!(fut.result().latency_seconds, Some(1.5e-3));
    }

    #[test]
    fn test_dropped_sender_becomes_error_result() {
        let (tx, fut) = RunnerFuture::pending();
        drop(tx);
        assert!(fut.result().error.is_some());
    }

    #[test]
    fn test_future_fulfilled_from_another_thread() {
        let (tx, fut) = RunnerFuture::pending();
        std::thread::spawn(move || {
            let _ = tx.send(RunnerResult::ok(2.0));
        });
        assert_eq!(fut.result().latency_seconds, Some(2.0));
    }

    #[test]
    fn test_result_constructors_populate_exactly_one_field() {
        let ok = BuilderResult::ok(PathBuf::from("/tmp/a.out"));
        assert!(ok.artifact_path.is_some() && ok.error.is_none());
        let err = BuilderResult::err("compiler exploded");
        assert!(err.artifact_path.is_none() && err.error.is_some());
    }
}
