//! Primitive implementations behind the instruction-kind registry.
//!
//! Sampling primitives apply their decision directly to the schedule; the
//! decision value is what mutation search resamples.

use smallvec::{smallvec, SmallVec};

use crate::common::AttrValue;
use crate::sched::{BlockId, Schedule, ScheduleError};
use crate::trace::{Decision, KindImpl, Value};
use crate::utils::perfect_tilings;

pub static KINDS: [KindImpl; 4] = [
    KindImpl {
        name: "GetBlock",
        stochastic: false,
        postproc: false,
        num_outputs: 1,
        apply: get_block_apply,
        decision_space: None,
    },
    KindImpl {
        name: "SampleComputeLocation",
        stochastic: true,
        postproc: false,
        num_outputs: 0,
        apply: sample_compute_location_apply,
        decision_space: Some(sample_compute_location_space),
    },
    KindImpl {
        name: "SamplePerfectTile",
        stochastic: true,
        postproc: false,
        num_outputs: 0,
        apply: sample_perfect_tile_apply,
        decision_space: Some(sample_perfect_tile_space),
    },
    KindImpl {
        name: "Vectorize",
        stochastic: false,
        postproc: true,
        num_outputs: 0,
        apply: vectorize_apply,
        decision_space: None,
    },
];

fn get_block_apply(
    sch: &mut Schedule,
    _inputs: &[Value],
    attrs: &[AttrValue],
    _decision: Option<&Decision>,
) -> Result<SmallVec<[Value; 1]>, ScheduleError> {
    let name = attr_str("GetBlock", attrs, 0)?;
    let id = sch.get_block(name)?;
    Ok(smallvec![Value::Block(id)])
}

fn sample_compute_location_apply(
    sch: &mut Schedule,
    inputs: &[Value],
    _attrs: &[AttrValue],
    decision: Option<&Decision>,
) -> Result<SmallVec<[Value; 1]>, ScheduleError> {
    let block = input_block("SampleComputeLocation", inputs, 0)?;
    let loc = decision_int("SampleComputeLocation", decision)?;
    sch.set_compute_at(block, loc)?;
    Ok(smallvec![])
}

fn sample_compute_location_space(
    sch: &Schedule,
    inputs: &[Value],
    _attrs: &[AttrValue],
) -> Result<Vec<Decision>, ScheduleError> {
    let block = input_block("SampleComputeLocation", inputs, 0)?;
    Ok(sch
        .collect_compute_locations(block)
        .into_iter()
        .map(Decision::Int)
        .collect())
}

fn sample_perfect_tile_apply(
    sch: &mut Schedule,
    inputs: &[Value],
    attrs: &[AttrValue],
    decision: Option<&Decision>,
) -> Result<SmallVec<[Value; 1]>, ScheduleError> {
    let block = input_block("SamplePerfectTile", inputs, 0)?;
    let (loop_idx, n_splits, _) = tile_attrs(attrs)?;
    let factors = decision_ints("SamplePerfectTile", decision)?;
    if factors.len() != n_splits {
        return Err(ScheduleError::IllegalDecision {
            kind: "SamplePerfectTile",
            detail: format!("expected {} factors, got {:?}", n_splits, factors),
        });
    }
    sch.split_loop(block, loop_idx, factors)?;
    Ok(smallvec![])
}

fn sample_perfect_tile_space(
    sch: &Schedule,
    inputs: &[Value],
    attrs: &[AttrValue],
) -> Result<Vec<Decision>, ScheduleError> {
    let block = input_block("SamplePerfectTile", inputs, 0)?;
    let (loop_idx, n_splits, max_innermost) = tile_attrs(attrs)?;
    let state = &sch.blocks()[block];
    let Some(loop_state) = state.loops.get(loop_idx) else {
        return Err(ScheduleError::LoopOutOfRange {
            block: state.name.clone(),
            index: loop_idx,
            len: state.loops.len(),
        });
    };
    Ok(perfect_tilings(loop_state.extent, n_splits, max_innermost)
        .into_iter()
        .map(Decision::Ints)
        .collect())
}

fn vectorize_apply(
    sch: &mut Schedule,
    inputs: &[Value],
    _attrs: &[AttrValue],
    _decision: Option<&Decision>,
) -> Result<SmallVec<[Value; 1]>, ScheduleError> {
    let block = input_block("Vectorize", inputs, 0)?;
    sch.vectorize_innermost(block)?;
    Ok(smallvec![])
}

fn tile_attrs(attrs: &[AttrValue]) -> Result<(usize, usize, i64), ScheduleError> {
    let loop_idx = attr_int("SamplePerfectTile", attrs, 0)?;
    let n_splits = attr_int("SamplePerfectTile", attrs, 1)?;
    let max_innermost = attr_int("SamplePerfectTile", attrs, 2)?;
    if loop_idx < 0 || n_splits < 1 || max_innermost < 1 {
        return Err(ScheduleError::Signature {
            kind: "SamplePerfectTile",
            detail: format!("bad attrs: {:?}", attrs),
        });
    }
    Ok((loop_idx as usize, n_splits as usize, max_innermost))
}

fn input_block(kind: &'static str, inputs: &[Value], idx: usize) -> Result<BlockId, ScheduleError> {
    match inputs.get(idx) {
        Some(Value::Block(b)) => Ok(*b),
        other => Err(ScheduleError::Signature {
            kind,
            detail: format!("input {} must be a block, got {:?}", idx, other),
        }),
    }
}

fn attr_str<'a>(
    kind: &'static str,
    attrs: &'a [AttrValue],
    idx: usize,
) -> Result<&'a str, ScheduleError> {
    match attrs.get(idx) {
        Some(AttrValue::Str(s)) => Ok(s),
        other => Err(ScheduleError::Signature {
            kind,
            detail: format!("attr {} must be a string, got {:?}", idx, other),
        }),
    }
}

fn attr_int(kind: &'static str, attrs: &[AttrValue], idx: usize) -> Result<i64, ScheduleError> {
    match attrs.get(idx) {
        Some(AttrValue::Int(v)) => Ok(*v),
        other => Err(ScheduleError::Signature {
            kind,
            detail: format!("attr {} must be an integer, got {:?}", idx, other),
        }),
    }
}

fn decision_int(kind: &'static str, decision: Option<&Decision>) -> Result<i64, ScheduleError> {
    match decision {
        Some(Decision::Int(v)) => Ok(*v),
        Some(other) => Err(ScheduleError::IllegalDecision {
            kind,
            detail: format!("expected an integer decision, got {:?}", other),
        }),
        None => Err(ScheduleError::MissingDecision { kind }),
    }
}

fn decision_ints<'a>(
    kind: &'static str,
    decision: Option<&'a Decision>,
) -> Result<&'a [i64], ScheduleError> {
    match decision {
        Some(Decision::Ints(vs)) => Ok(vs),
        Some(other) => Err(ScheduleError::IllegalDecision {
            kind,
            detail: format!("expected an integer-list decision, got {:?}", other),
        }),
        None => Err(ScheduleError::MissingDecision { kind }),
    }
}
