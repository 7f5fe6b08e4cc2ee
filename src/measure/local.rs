//! Builder and runner implementations backed by a local C toolchain.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::path::PathBuf;
use std::process::Command;
use tempfile::tempdir;

use super::{BuildInput, Builder, BuilderResult, Runner, RunnerFuture, RunnerInput, RunnerResult};
use crate::codegen;
use crate::randstate::RandState;
use crate::sched::Schedule;

/// Compiles candidates by replaying their traces, emitting C, and invoking
/// the compiler named by `$CC`. Candidates in a batch are independent, so the
/// batch is compiled in parallel; per-candidate failures become error-carrying
/// results rather than aborting the batch.
pub struct LocalBuilder {
    cc: String,
}

impl LocalBuilder {
    pub fn new() -> Self {
        let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_owned());
        LocalBuilder { cc }
    }

    pub fn with_compiler(cc: impl Into<String>) -> Self {
        LocalBuilder { cc: cc.into() }
    }

    fn build_one(&self, input: &BuildInput) -> Result<PathBuf> {
        // Replay against fresh schedule state. Every decision is recorded in
        // the trace by this point, so the seed below is never consulted.
        let mut sch = Schedule::new(input.mod_, RandState::new(0))?;
        input
            .candidate
            .trace
            .apply_to_schedule(&mut sch, false, None)?;

        let arg_bytes: i64 = input
            .candidate
            .args_info
            .iter()
            .map(|info| {
                let crate::arginfo::ArgInfo::Tensor(t) = info;
                t.size_bytes()
            })
            .sum();
        log::debug!("building candidate with {} argument bytes", arg_bytes);

        let mut source = String::new();
        codegen::emit(&mut source, &sch, &input.candidate.args_info, input.target)
            .context("emitting C source")?;

        // The directory is deliberately left in place; the artifact-cleanup
        // callback owns its removal after measurement.
        let dirname = tempdir()?.into_path();
        let source_path = dirname.join("main.c");
        let binary_path = dirname.join("a.out");
        std::fs::write(&source_path, source)?;

        let cc_proc = Command::new(&self.cc)
            .args(["-O2", "-o"])
            .arg(&binary_path)
            .arg(&source_path)
            .output()
            .with_context(|| format!("invoking {}", self.cc))?;
        if !cc_proc.status.success() {
            bail!(
                "{} exited with {}\n{}",
                self.cc,
                cc_proc.status,
                String::from_utf8_lossy(&cc_proc.stderr)
            );
        }
        Ok(binary_path)
    }
}

impl Default for LocalBuilder {
    fn default() -> Self {
        LocalBuilder::new()
    }
}

impl Builder for LocalBuilder {
    fn build(&self, inputs: &[BuildInput]) -> Vec<BuilderResult> {
        inputs
            .par_iter()
            .map(|input| match self.build_one(input) {
                Ok(path) => BuilderResult::ok(path),
                Err(e) => BuilderResult::err(format!("{:#}", e)),
            })
            .collect()
    }
}

/// Executes built artifacts and parses the nanosecond figure they report.
/// Each measurement runs on its own thread and fulfills a future, so slow or
/// wedged artifacts only delay their own slot.
pub struct LocalRunner;

impl Runner for LocalRunner {
    fn run(&self, inputs: Vec<RunnerInput>) -> Vec<RunnerFuture> {
        inputs
            .into_iter()
            .map(|input| {
                let (tx, fut) = RunnerFuture::pending();
                std::thread::spawn(move || {
                    let _ = tx.send(run_one(&input));
                });
                fut
            })
            .collect()
    }
}

fn run_one(input: &RunnerInput) -> RunnerResult {
    let output = match Command::new(&input.artifact_path).output() {
        Ok(output) => output,
        Err(e) => {
            return RunnerResult::err(format!(
                "failed to execute {}: {}",
                input.artifact_path.display(),
                e
            ))
        }
    };
    if !output.status.success() {
        return RunnerResult::err(format!(
            "artifact exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    match stdout.trim().parse::<i64>() {
        Ok(nanos) => RunnerResult::ok(nanos as f64 * 1e-9),
        Err(_) => RunnerResult::err(format!("could not parse timer output: {:?}", stdout)),
    }
}
