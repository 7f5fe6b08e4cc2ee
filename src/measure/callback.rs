use std::io::Write;
use std::path::Path;

use serde_json::json;

use super::{BuilderResult, MeasureCandidate, RunnerResult};

/// The scheduler-side context a callback sees for one completed round.
pub struct RoundView<'a> {
    pub task_id: usize,
    pub task_name: &'a str,
    pub round: usize,
}

/// A post-round hook invoked once per round, after both build and run
/// complete, with the positionally aligned candidate/result triple.
///
/// Callbacks must treat a populated `error` field as "no artifact produced;
/// skip anything depending on it," never as a reason to abort the round.
pub trait MeasureCallback: Send {
    fn apply(
        &mut self,
        round: &RoundView,
        candidates: &[MeasureCandidate],
        builder_results: &[BuilderResult],
        runner_results: &[RunnerResult],
    );
}

pub type ArtifactRemover = Box<dyn Fn(&Path) -> std::io::Result<()> + Send>;

/// Deletes build artifacts once their measurements are in. The removal
/// capability is injected at construction rather than looked up globally.
pub struct RemoveBuildArtifact {
    remover: ArtifactRemover,
}

impl RemoveBuildArtifact {
    pub fn new(remover: ArtifactRemover) -> Self {
        RemoveBuildArtifact { remover }
    }
}

impl Default for RemoveBuildArtifact {
    /// Removes the artifact's whole build directory, since the local builder
    /// leaves source and binary side by side in one temp dir.
    fn default() -> Self {
        RemoveBuildArtifact::new(Box::new(|path| {
            match path.parent() {
                Some(dir) => std::fs::remove_dir_all(dir),
                None => std::fs::remove_file(path),
            }
        }))
    }
}

impl MeasureCallback for RemoveBuildArtifact {
    fn apply(
        &mut self,
        _round: &RoundView,
        _candidates: &[MeasureCandidate],
        builder_results: &[BuilderResult],
        _runner_results: &[RunnerResult],
    ) {
        for build_result in builder_results {
            if let Some(path) = &build_result.artifact_path {
                if let Err(e) = (self.remover)(path) {
                    log::warn!("failed to remove build artifact {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Appends one JSON line per measured candidate, for offline analysis and
/// cost-model training.
pub struct RecordToFile {
    out: Box<dyn Write + Send>,
}

impl RecordToFile {
    pub fn new(path: &Path) -> std::io::Result<Self> {
        Ok(RecordToFile {
            out: Box::new(std::fs::File::create(path)?),
        })
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        RecordToFile { out }
    }
}

impl MeasureCallback for RecordToFile {
    fn apply(
        &mut self,
        round: &RoundView,
        candidates: &[MeasureCandidate],
        _builder_results: &[BuilderResult],
        runner_results: &[RunnerResult],
    ) {
        for (candidate, result) in candidates.iter().zip(runner_results) {
            let record = json!({
                "task": round.task_name,
                "round": round.round,
                "latency_seconds": result.latency_seconds,
                "error": result.error,
                "trace": candidate.trace.to_json(),
            });
            if let Err(e) = writeln!(self.out, "{}", record) {
                log::warn!("failed to append measurement record: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn round<'a>() -> RoundView<'a> {
        RoundView {
            task_id: 0,
            task_name: "matmul",
            round: 3,
        }
    }

    #[test]
    fn test_remove_artifact_called_once_per_defined_path() {
        let removed: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let sink = Arc::clone(&removed);
        let mut cb = RemoveBuildArtifact::new(Box::new(move |p| {
            sink.lock().unwrap().push(p.to_owned());
            Ok(())
        }));
        let builder_results = vec![
            BuilderResult::ok(PathBuf::from("/tmp/build0/a.out")),
            BuilderResult::err("did not compile"),
        ];
        cb.apply(&round(), &[], &builder_results, &[]);
        assert_eq!(
            *removed.lock().unwrap(),
            vec![PathBuf::from("/tmp/build0/a.out")]
        );
    }

    #[test]
    fn test_remove_artifact_failure_is_best_effort() {
        let mut cb = RemoveBuildArtifact::new(Box::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "nope"))
        }));
        let builder_results = vec![BuilderResult::ok(PathBuf::from("/tmp/gone"))];
        // Must not panic or abort.
        cb.apply(&round(), &[], &builder_results, &[]);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_record_to_file_writes_one_line_per_candidate() {
        use crate::randstate::RandState;
        use crate::sched::Schedule;
        use crate::workload;

        let mod_ = workload::matmul(8, 8, 8);
        let skeleton = workload::schedule_skeleton(&mod_).unwrap();
        let mut sch = Schedule::new(&mod_, RandState::new(0)).unwrap();
        let trace = skeleton.apply_to_schedule(&mut sch, false, None).unwrap();
        let candidate = MeasureCandidate {
            trace,
            args_info: vec![],
        };

        let buf = SharedBuf::default();
        let mut cb = RecordToFile::from_writer(Box::new(buf.clone()));
        let runner_results = vec![RunnerResult::ok(1e-3), RunnerResult::err("timeout")];
        cb.apply(
            &round(),
            &[candidate.clone(), candidate],
            &[],
            &runner_results,
        );

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["task"], "matmul");
        assert_eq!(first["latency_seconds"], 1e-3);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["error"], "timeout");
    }
}
