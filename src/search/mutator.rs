use std::sync::Arc;

use crate::module::IrModule;
use crate::randstate::RandState;
use crate::sched::Schedule;
use crate::scheduler::TuneContext;
use crate::trace::{Decision, Instruction, InstructionKind, Trace, Value};

/// A search operator that proposes a structurally-close neighbor of a trace
/// by resampling one decision.
///
/// Mutators are bound to a fixed starting program via
/// `initialize_with_tune_context` and may then be applied concurrently from
/// different tasks, provided each task holds its own clone and its own forked
/// random stream.
pub trait Mutator: Send {
    fn name(&self) -> &'static str;

    /// Binds the mutator to the task's workload. The module is retained for
    /// reuse, since every `apply` re-materializes a schedule state from it.
    fn initialize_with_tune_context(&mut self, ctx: &TuneContext);

    /// Proposes a mutated trace, or `None` when no instruction of the
    /// targeted kind has a legal alternative decision. `None` is not an
    /// error; the caller simply retries with another mutator or seed.
    fn apply(&self, trace: &Trace, rand: &mut RandState) -> Option<Trace>;

    fn clone_boxed(&self) -> Box<dyn Mutator>;
}

/// Mutates the compute-at location decision of a `SampleComputeLocation`
/// instruction.
#[derive(Clone, Default)]
pub struct MutateComputeLocation {
    mod_: Option<IrModule>,
}

/// Mutates the factor decision of a `SamplePerfectTile` instruction,
/// preserving the factor product.
#[derive(Clone, Default)]
pub struct MutateTileSize {
    mod_: Option<IrModule>,
}

struct DecisionCandidate {
    inst: Arc<Instruction>,
    alternatives: Vec<Decision>,
}

/// Replays `trace` with an observing decision provider and collects every
/// instruction of `kind` whose decision can be changed to at least one other
/// value. The legal set is re-derived from the live schedule state at the
/// instruction's own replay point, not taken from the recorded decision.
fn find_candidates(
    mod_: &IrModule,
    trace: &Trace,
    kind: InstructionKind,
    rand: &mut RandState,
) -> Option<Vec<DecisionCandidate>> {
    let mut sch = Schedule::new(mod_, rand.fork()).ok()?;
    let mut candidates: Vec<DecisionCandidate> = Vec::new();
    let mut provider = |sch: &Schedule,
                        inst: &Arc<Instruction>,
                        inputs: &[Value],
                        decision: Option<&Decision>|
     -> Option<Decision> {
        if inst.kind.same_as(kind) {
            if let (Some(old), Ok(mut space)) =
                (decision, inst.kind.decision_space(sch, inputs, &inst.attrs))
            {
                space.retain(|d| d != old);
                if !space.is_empty() {
                    candidates.push(DecisionCandidate {
                        inst: Arc::clone(inst),
                        alternatives: space,
                    });
                }
            }
        }
        decision.cloned()
    };
    trace
        .apply_to_schedule(&mut sch, true, Some(&mut provider))
        .ok()?;
    Some(candidates)
}

fn mutate_decision(
    mod_: Option<&IrModule>,
    trace: &Trace,
    kind_name: &'static str,
    rand: &mut RandState,
) -> Option<Trace> {
    let mod_ = mod_?;
    let kind = InstructionKind::get(kind_name).ok()?;
    let candidates = find_candidates(mod_, trace, kind, rand)?;
    let candidate = rand.choose(&candidates)?;
    let decision = rand.choose(&candidate.alternatives)?.clone();
    // Downstream postprocessing is invalidated by the change.
    trace.with_decision(&candidate.inst, decision, true)
}

impl Mutator for MutateComputeLocation {
    fn name(&self) -> &'static str {
        "MutateComputeLocation"
    }

    fn initialize_with_tune_context(&mut self, ctx: &TuneContext) {
        self.mod_ = Some(ctx.mod_.clone());
    }

    fn apply(&self, trace: &Trace, rand: &mut RandState) -> Option<Trace> {
        mutate_decision(self.mod_.as_ref(), trace, "SampleComputeLocation", rand)
    }

    fn clone_boxed(&self) -> Box<dyn Mutator> {
        Box::new(self.clone())
    }
}

impl Mutator for MutateTileSize {
    fn name(&self) -> &'static str {
        "MutateTileSize"
    }

    fn initialize_with_tune_context(&mut self, ctx: &TuneContext) {
        self.mod_ = Some(ctx.mod_.clone());
    }

    fn apply(&self, trace: &Trace, rand: &mut RandState) -> Option<Trace> {
        mutate_decision(self.mod_.as_ref(), trace, "SamplePerfectTile", rand)
    }

    fn clone_boxed(&self) -> Box<dyn Mutator> {
        Box::new(self.clone())
    }
}

/// The default mutator pool with selection weights.
pub fn standard_mutators() -> Vec<(Box<dyn Mutator>, f64)> {
    vec![
        (Box::<MutateTileSize>::default(), 0.9),
        (Box::<MutateComputeLocation>::default(), 0.1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BlockDef, Param, PrimFunc};
    use crate::randstate::RandState;
    use crate::target::Target;
    use crate::workload;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn ctx_for(mod_: IrModule) -> TuneContext {
        let space = workload::schedule_skeleton(&mod_).unwrap();
        TuneContext::new(
            "test",
            mod_,
            Target::new("cpu").unwrap(),
            space,
            RandState::new(0),
            64,
        )
    }

    fn sampled_trace(mod_: &IrModule, seed: u64) -> Trace {
        let skeleton = workload::schedule_skeleton(mod_).unwrap();
        let mut sch = Schedule::new(mod_, RandState::new(seed)).unwrap();
        skeleton.apply_to_schedule(&mut sch, false, None).unwrap()
    }

    /// A single block has no consumer, so root is the only legal location.
    fn single_block_module() -> IrModule {
        IrModule::new(vec![(
            "main".to_owned(),
            PrimFunc {
                params: Vec::<Param>::new(),
                is_entry: true,
                body: vec![BlockDef {
                    name: "only".to_owned(),
                    loop_extents: smallvec![8, 8],
                    layout_rewrite_preproc: false,
                }],
            },
        )])
    }

    #[test]
    fn test_no_alternative_location_yields_no_mutation() {
        let mod_ = single_block_module();
        let mut mutator = MutateComputeLocation::default();
        mutator.initialize_with_tune_context(&ctx_for(mod_.clone()));
        let trace = sampled_trace(&mod_, 1);
        let mut rand = RandState::new(2);
        assert!(mutator.apply(&trace, &mut rand).is_none());
    }

    #[test]
    fn test_uninitialized_mutator_proposes_nothing() {
        let mod_ = workload::matmul(16, 16, 16);
        let trace = sampled_trace(&mod_, 1);
        let mut rand = RandState::new(2);
        assert!(MutateComputeLocation::default().apply(&trace, &mut rand).is_none());
    }

    #[test]
    fn test_mutation_is_deterministic_for_fixed_rand() {
        let mod_ = workload::matmul(16, 16, 16);
        let mut mutator = MutateTileSize::default();
        mutator.initialize_with_tune_context(&ctx_for(mod_.clone()));
        let trace = sampled_trace(&mod_, 1);
        let a = mutator.apply(&trace, &mut RandState::new(9)).unwrap();
        let b = mutator.apply(&trace, &mut RandState::new(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_tile_mutation_changes_exactly_one_decision() {
        let mod_ = workload::matmul(16, 16, 16);
        let mut mutator = MutateTileSize::default();
        mutator.initialize_with_tune_context(&ctx_for(mod_.clone()));
        let trace = sampled_trace(&mod_, 1);
        let mutated = mutator.apply(&trace, &mut RandState::new(4)).unwrap();
        let changed: Vec<_> = trace
            .insts()
            .iter()
            .zip(mutated.insts())
            .filter(|(a, b)| a.decision != b.decision)
            .collect();
        assert_eq!(changed.len(), 1);
        let (before, after) = (&changed[0].0.decision, &changed[0].1.decision);
        let product = |d: &Option<Decision>| match d {
            Some(Decision::Ints(vs)) => vs.iter().product::<i64>(),
            other => panic!("expected factors, got {:?}", other),
        };
        assert_eq!(product(before), product(after));
    }

    proptest! {
        /// A mutated trace always replays without a legality error.
        #[test]
        fn test_mutator_never_proposes_illegal_trace(seed in 0u64..64) {
            let mod_ = workload::matmul(16, 16, 16);
            let trace = sampled_trace(&mod_, seed);
            for (mut mutator, _) in standard_mutators() {
                mutator.initialize_with_tune_context(&ctx_for(mod_.clone()));
                let mut rand = RandState::new(seed.wrapping_add(1));
                if let Some(mutated) = mutator.apply(&trace, &mut rand) {
                    let mut sch = Schedule::new(&mod_, RandState::new(0)).unwrap();
                    prop_assert!(mutated.apply_to_schedule(&mut sch, true, None).is_ok());
                }
            }
        }
    }
}
