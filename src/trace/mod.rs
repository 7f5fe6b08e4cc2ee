use lazy_static::lazy_static;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::common::AttrValue;
use crate::sched::{primitives, BlockId, Schedule, ScheduleError};

/// Index of a symbolic register holding one instruction output.
pub type Rv = usize;

/// A value produced by replaying an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Value {
    Block(BlockId),
    Int(i64),
}

/// The chosen parameter of one stochastic instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Int(i64),
    Ints(Vec<i64>),
}

/// An instruction input: a reference to a prior instruction's output register
/// or an inline literal.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Out(Rv),
    Lit(AttrValue),
}

pub type ApplyFn = fn(
    &mut Schedule,
    &[Value],
    &[AttrValue],
    Option<&Decision>,
) -> Result<SmallVec<[Value; 1]>, ScheduleError>;

pub type DecisionSpaceFn =
    fn(&Schedule, &[Value], &[AttrValue]) -> Result<Vec<Decision>, ScheduleError>;

/// The registered implementation of one transformation primitive.
pub struct KindImpl {
    pub name: &'static str,
    pub stochastic: bool,
    /// Postprocessing (codegen-only) steps are stripped before mutation
    /// search, which operates on scheduling decisions only.
    pub postproc: bool,
    pub num_outputs: usize,
    pub apply: ApplyFn,
    /// For stochastic kinds: the full legal decision set in the current
    /// schedule state. Re-derived on every call, never cached.
    pub decision_space: Option<DecisionSpaceFn>,
}

/// A handle to a registered primitive. Identity is pointer identity into the
/// process-wide registry, which is populated once at startup and read-only
/// thereafter.
#[derive(Clone, Copy)]
pub struct InstructionKind(&'static KindImpl);

lazy_static! {
    static ref KIND_REGISTRY: HashMap<&'static str, InstructionKind> = primitives::KINDS
        .iter()
        .map(|k| (k.name, InstructionKind(k)))
        .collect();
}

impl InstructionKind {
    pub fn get(name: &str) -> Result<InstructionKind, ScheduleError> {
        KIND_REGISTRY
            .get(name)
            .copied()
            .ok_or_else(|| ScheduleError::UnknownKind(name.to_owned()))
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn is_stochastic(&self) -> bool {
        self.0.stochastic
    }

    pub fn is_postproc(&self) -> bool {
        self.0.postproc
    }

    pub fn num_outputs(&self) -> usize {
        self.0.num_outputs
    }

    pub fn same_as(&self, other: InstructionKind) -> bool {
        std::ptr::eq(self.0, other.0)
    }

    fn apply(
        &self,
        sch: &mut Schedule,
        inputs: &[Value],
        attrs: &[AttrValue],
        decision: Option<&Decision>,
    ) -> Result<SmallVec<[Value; 1]>, ScheduleError> {
        (self.0.apply)(sch, inputs, attrs, decision)
    }

    pub fn decision_space(
        &self,
        sch: &Schedule,
        inputs: &[Value],
        attrs: &[AttrValue],
    ) -> Result<Vec<Decision>, ScheduleError> {
        match self.0.decision_space {
            Some(f) => f(sch, inputs, attrs),
            None => Err(ScheduleError::Signature {
                kind: self.name(),
                detail: "kind has no decision space".to_owned(),
            }),
        }
    }
}

impl PartialEq for InstructionKind {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(*other)
    }
}

impl Eq for InstructionKind {}

impl Debug for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// One primitive application within a trace. Immutable once constructed; all
/// "mutation" produces a new instruction in a new trace.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub inputs: SmallVec<[Operand; 2]>,
    pub attrs: SmallVec<[AttrValue; 2]>,
    pub outputs: SmallVec<[Rv; 1]>,
    pub decision: Option<Decision>,
}

/// A decision provider observes every stochastic instruction during replay,
/// with the live schedule state and resolved inputs, and returns the decision
/// to apply: the observed one to keep it, a different one to override, or
/// `None` to have the schedule resample from the legal set.
pub type DecisionProvider<'a> =
    &'a mut dyn FnMut(&Schedule, &Arc<Instruction>, &[Value], Option<&Decision>) -> Option<Decision>;

/// An ordered, replayable record of primitive applications.
///
/// Replaying a trace against the same module deterministically reproduces the
/// same schedule, provided the same decisions are supplied for stochastic
/// instructions. Traces share instruction storage structurally: substituting
/// one decision clones only the affected instruction.
#[derive(Clone, Debug, Default)]
pub struct Trace {
    insts: Vec<Arc<Instruction>>,
    registers: usize,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn insts(&self) -> &[Arc<Instruction>] {
        &self.insts
    }

    /// The recorded decision of `inst`, which must be an instruction of this
    /// trace (pointer identity).
    pub fn get_decision(&self, inst: &Arc<Instruction>) -> Option<&Decision> {
        self.insts
            .iter()
            .find(|i| Arc::ptr_eq(i, inst))
            .and_then(|i| i.decision.as_ref())
    }

    /// Replays every instruction against `sch`, resolving each kind from the
    /// registry. Returns the effective trace: identical to `self` except
    /// where the provider overrode a decision or a missing decision was
    /// sampled. Fails with a [ScheduleError] when a decision is illegal for
    /// the current schedule state; callers treat that as a rejected
    /// candidate.
    pub fn apply_to_schedule(
        &self,
        sch: &mut Schedule,
        remove_postproc: bool,
        mut provider: Option<DecisionProvider>,
    ) -> Result<Trace, ScheduleError> {
        let cut = if remove_postproc {
            self.postproc_cut()
        } else {
            self.insts.len()
        };
        let mut values: Vec<Option<Value>> = vec![None; self.registers];
        let mut effective: Vec<Arc<Instruction>> = Vec::with_capacity(cut);

        for inst in &self.insts[..cut] {
            let kind = inst.kind;
            let inputs = resolve_inputs(kind, &inst.inputs, &values)?;

            let mut decision = inst.decision.clone();
            if kind.is_stochastic() {
                if let Some(p) = provider.as_mut() {
                    decision = p(sch, inst, &inputs, decision.as_ref());
                }
                if decision.is_none() {
                    let mut space = kind.decision_space(sch, &inputs, &inst.attrs)?;
                    if space.is_empty() {
                        return Err(ScheduleError::NoLegalDecision { kind: kind.name() });
                    }
                    let idx = sch.rand_mut().sample_int(0, space.len());
                    decision = Some(space.swap_remove(idx));
                }
            }

            let outs = kind.apply(sch, &inputs, &inst.attrs, decision.as_ref())?;
            if outs.len() != inst.outputs.len() {
                return Err(ScheduleError::Signature {
                    kind: kind.name(),
                    detail: format!(
                        "produced {} outputs where {} were declared",
                        outs.len(),
                        inst.outputs.len()
                    ),
                });
            }
            for (&rv, v) in inst.outputs.iter().zip(outs) {
                values[rv] = Some(v);
            }

            if decision == inst.decision {
                effective.push(Arc::clone(inst));
            } else {
                effective.push(Arc::new(Instruction {
                    decision,
                    ..(**inst).clone()
                }));
            }
        }

        Ok(Trace {
            insts: effective,
            registers: self.registers,
        })
    }

    /// Returns a new trace in which `inst`'s decision is replaced.
    /// Instructions after it are preserved structurally; their references are
    /// re-resolved at the next replay rather than eagerly. Returns `None` if
    /// `inst` is not an instruction of this trace.
    pub fn with_decision(
        &self,
        inst: &Arc<Instruction>,
        decision: Decision,
        remove_postproc: bool,
    ) -> Option<Trace> {
        let idx = self.insts.iter().position(|i| Arc::ptr_eq(i, inst))?;
        let mut insts = self.insts.clone();
        insts[idx] = Arc::new(Instruction {
            decision: Some(decision),
            ..(**inst).clone()
        });
        if remove_postproc {
            while insts.last().is_some_and(|i| i.kind.is_postproc()) {
                insts.pop();
            }
        }
        Some(Trace {
            insts,
            registers: self.registers,
        })
    }

    fn postproc_cut(&self) -> usize {
        let mut cut = self.insts.len();
        while cut > 0 && self.insts[cut - 1].kind.is_postproc() {
            cut -= 1;
        }
        cut
    }

    /// A JSON rendering of the trace, used for result records and for
    /// duplicate detection during search.
    pub fn to_json(&self) -> Json {
        Json::Array(
            self.insts
                .iter()
                .map(|inst| {
                    json!({
                        "kind": inst.kind.name(),
                        "inputs": inst.inputs.iter().map(operand_json).collect::<Vec<_>>(),
                        "attrs": inst.attrs.iter().map(attr_json).collect::<Vec<_>>(),
                        "outputs": inst.outputs.iter().map(|rv| format!("%{}", rv)).collect::<Vec<_>>(),
                        "decision": inst.decision.as_ref().map(decision_json),
                    })
                })
                .collect(),
        )
    }
}

impl PartialEq for Trace {
    fn eq(&self, other: &Self) -> bool {
        self.registers == other.registers
            && self.insts.len() == other.insts.len()
            && self
                .insts
                .iter()
                .zip(&other.insts)
                .all(|(a, b)| **a == **b)
    }
}

impl Display for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn resolve_inputs(
    kind: InstructionKind,
    operands: &[Operand],
    values: &[Option<Value>],
) -> Result<SmallVec<[Value; 2]>, ScheduleError> {
    operands
        .iter()
        .map(|op| match op {
            Operand::Out(rv) => values
                .get(*rv)
                .copied()
                .flatten()
                .ok_or(ScheduleError::UnboundInput(*rv)),
            Operand::Lit(AttrValue::Int(v)) => Ok(Value::Int(*v)),
            Operand::Lit(other) => Err(ScheduleError::Signature {
                kind: kind.name(),
                detail: format!("literal input {} is not an integer", other),
            }),
        })
        .collect()
}

fn operand_json(op: &Operand) -> Json {
    match op {
        Operand::Out(rv) => json!(format!("%{}", rv)),
        Operand::Lit(a) => attr_json(a),
    }
}

fn attr_json(attr: &AttrValue) -> Json {
    match attr {
        AttrValue::Int(v) => json!(v),
        AttrValue::Str(s) => json!(s),
        AttrValue::Bool(b) => json!(b),
    }
}

pub(crate) fn decision_json(d: &Decision) -> Json {
    match d {
        Decision::Int(v) => json!(v),
        Decision::Ints(vs) => json!(vs),
    }
}

/// Builds a trace instruction-by-instruction, assigning output registers.
#[derive(Default)]
pub struct TraceBuilder {
    insts: Vec<Arc<Instruction>>,
    next_rv: Rv,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction and returns the registers holding its outputs.
    pub fn push(
        &mut self,
        kind: InstructionKind,
        inputs: impl IntoIterator<Item = Operand>,
        attrs: impl IntoIterator<Item = AttrValue>,
        decision: Option<Decision>,
    ) -> SmallVec<[Rv; 1]> {
        let outputs: SmallVec<[Rv; 1]> = (self.next_rv..self.next_rv + kind.num_outputs()).collect();
        self.next_rv += kind.num_outputs();
        self.insts.push(Arc::new(Instruction {
            kind,
            inputs: inputs.into_iter().collect(),
            attrs: attrs.into_iter().collect(),
            outputs: outputs.clone(),
            decision,
        }));
        outputs
    }

    pub fn build(self) -> Trace {
        Trace {
            insts: self.insts,
            registers: self.next_rv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randstate::RandState;
    use crate::workload;

    fn replay_skeleton(seed: u64) -> (Trace, Schedule) {
        let m = workload::matmul(16, 16, 16);
        let skeleton = workload::schedule_skeleton(&m).unwrap();
        let mut sch = Schedule::new(&m, RandState::new(seed)).unwrap();
        let effective = skeleton.apply_to_schedule(&mut sch, false, None).unwrap();
        (effective, sch)
    }

    fn nth_of_kind(trace: &Trace, kind: &str, n: usize) -> Arc<Instruction> {
        Arc::clone(
            trace
                .insts()
                .iter()
                .filter(|i| i.kind.name() == kind)
                .nth(n)
                .unwrap(),
        )
    }

    #[test]
    fn test_unknown_kind_lookup_fails() {
        assert!(matches!(
            InstructionKind::get("NoSuchPrimitive"),
            Err(ScheduleError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_skeleton_sampling_is_deterministic() {
        let (t1, s1) = replay_skeleton(42);
        let (t2, s2) = replay_skeleton(42);
        assert_eq!(t1, t2);
        assert_eq!(s1.blocks(), s2.blocks());
    }

    #[test]
    fn test_effective_trace_replays_to_same_state() {
        let m = workload::matmul(16, 16, 16);
        let (effective, sch) = replay_skeleton(42);
        // All decisions are now recorded, so the random seed is irrelevant.
        let mut sch2 = Schedule::new(&m, RandState::new(999)).unwrap();
        let again = effective.apply_to_schedule(&mut sch2, false, None).unwrap();
        assert_eq!(effective, again);
        assert_eq!(sch.blocks(), sch2.blocks());
    }

    #[test]
    fn test_with_decision_noop_roundtrip() {
        let m = workload::matmul(16, 16, 16);
        let (trace, sch) = replay_skeleton(7);
        let inst = nth_of_kind(&trace, "SampleComputeLocation", 0);
        let decision = trace.get_decision(&inst).cloned().unwrap();
        let overridden = trace.with_decision(&inst, decision, false).unwrap();
        assert_eq!(overridden, trace);
        let mut sch2 = Schedule::new(&m, RandState::new(0)).unwrap();
        overridden.apply_to_schedule(&mut sch2, false, None).unwrap();
        assert_eq!(sch.blocks(), sch2.blocks());
    }

    #[test]
    fn test_with_decision_strips_postproc_suffix() {
        let (trace, _) = replay_skeleton(7);
        let inst = nth_of_kind(&trace, "SamplePerfectTile", 0);
        let overridden = trace
            .with_decision(&inst, Decision::Ints(vec![16, 1]), true)
            .unwrap();
        assert_eq!(overridden.len(), trace.len() - 1);
        assert!(overridden.insts().iter().all(|i| !i.kind.is_postproc()));
    }

    #[test]
    fn test_with_decision_rejects_foreign_instruction() {
        let (trace, _) = replay_skeleton(7);
        let (other, _) = replay_skeleton(7);
        let foreign = nth_of_kind(&other, "SampleComputeLocation", 0);
        assert!(trace.with_decision(&foreign, Decision::Int(-1), false).is_none());
    }

    #[test]
    fn test_replay_with_remove_postproc_skips_vectorize() {
        let m = workload::matmul(16, 16, 16);
        let (trace, _) = replay_skeleton(3);
        let mut sch = Schedule::new(&m, RandState::new(0)).unwrap();
        let effective = trace.apply_to_schedule(&mut sch, true, None).unwrap();
        assert_eq!(effective.len(), trace.len() - 1);
        assert!(sch.blocks().iter().all(|b| !b.vectorized));
    }

    #[test]
    fn test_illegal_override_fails_replay() {
        let m = workload::matmul(16, 16, 16);
        let (trace, _) = replay_skeleton(5);
        // The final block's only legal location is the root.
        let inst = nth_of_kind(&trace, "SampleComputeLocation", 1);
        let bad = trace.with_decision(&inst, Decision::Int(5), false).unwrap();
        let mut sch = Schedule::new(&m, RandState::new(0)).unwrap();
        assert!(matches!(
            bad.apply_to_schedule(&mut sch, false, None),
            Err(ScheduleError::IllegalDecision { .. })
        ));
    }

    #[test]
    fn test_provider_observes_every_stochastic_instruction() {
        let m = workload::matmul(16, 16, 16);
        let (trace, _) = replay_skeleton(11);
        let stochastic = trace
            .insts()
            .iter()
            .filter(|i| i.kind.is_stochastic())
            .count();
        let mut seen = 0;
        let mut provider = |_: &Schedule,
                            _: &Arc<Instruction>,
                            _: &[Value],
                            decision: Option<&Decision>|
         -> Option<Decision> {
            seen += 1;
            decision.cloned()
        };
        let mut sch = Schedule::new(&m, RandState::new(0)).unwrap();
        let same = trace
            .apply_to_schedule(&mut sch, false, Some(&mut provider))
            .unwrap();
        assert_eq!(seen, stochastic);
        assert_eq!(same, trace);
    }
}
