pub mod primitives;

use smallvec::SmallVec;

use crate::module::{EntryFuncError, IrModule};
use crate::randstate::RandState;

pub type BlockId = usize;

/// Materialized schedule state for one replay of a trace.
///
/// A `Schedule` is created fresh from the workload module for every replay
/// attempt; the module itself is never mutated. Blocks are the schedulable
/// units: each carries its current loop nest (which splitting rewrites) and
/// its compute-at anchor within its consumer.
#[derive(Debug)]
pub struct Schedule {
    blocks: Vec<BlockState>,
    rand: RandState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockState {
    pub name: String,
    pub loops: SmallVec<[LoopState; 4]>,
    pub compute_at: ComputeLoc,
    pub vectorized: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopState {
    pub extent: i64,
}

/// Where a block is computed relative to its consumer: fully inlined, at the
/// root (outside every consumer loop), or under the consumer loop at a depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeLoc {
    Inlined,
    Root,
    At(usize),
}

impl ComputeLoc {
    /// The integer encoding used in decisions: -2 inlined, -1 root, n >= 0 a
    /// consumer loop depth.
    pub fn index(&self) -> i64 {
        match self {
            ComputeLoc::Inlined => -2,
            ComputeLoc::Root => -1,
            ComputeLoc::At(d) => *d as i64,
        }
    }

    pub fn from_index(index: i64) -> Option<ComputeLoc> {
        match index {
            -2 => Some(ComputeLoc::Inlined),
            -1 => Some(ComputeLoc::Root),
            d if d >= 0 => Some(ComputeLoc::At(d as usize)),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    Entry(#[from] EntryFuncError),
    #[error("no block named {0:?} in the schedule")]
    UnknownBlock(String),
    #[error("loop index {index} out of range for block {block:?} with {len} loops")]
    LoopOutOfRange {
        block: String,
        index: usize,
        len: usize,
    },
    #[error("illegal decision for {kind}: {detail}")]
    IllegalDecision { kind: &'static str, detail: String },
    #[error("stochastic instruction {kind} has no decision and no provider supplied one")]
    MissingDecision { kind: &'static str },
    #[error("no legal decision exists for {kind} in the current schedule state")]
    NoLegalDecision { kind: &'static str },
    #[error("no primitive registered under the name {0:?}")]
    UnknownKind(String),
    #[error("instruction input refers to unbound register %{0}")]
    UnboundInput(usize),
    #[error("malformed {kind} instruction: {detail}")]
    Signature { kind: &'static str, detail: String },
}

impl Schedule {
    /// Materializes schedule state from the module's entry function.
    pub fn new(mod_: &IrModule, rand: RandState) -> Result<Schedule, ScheduleError> {
        let func = mod_.entry_func()?;
        let blocks = func
            .body
            .iter()
            .map(|def| BlockState {
                name: def.name.clone(),
                loops: def.loop_extents.iter().map(|&extent| LoopState { extent }).collect(),
                compute_at: ComputeLoc::Root,
                vectorized: false,
            })
            .collect();
        Ok(Schedule { blocks, rand })
    }

    pub fn blocks(&self) -> &[BlockState] {
        &self.blocks
    }

    pub fn get_block(&self, name: &str) -> Result<BlockId, ScheduleError> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| ScheduleError::UnknownBlock(name.to_owned()))
    }

    pub(crate) fn rand_mut(&mut self) -> &mut RandState {
        &mut self.rand
    }

    /// Collects every legal compute location for `block` in the current
    /// state, as decision indices. A block's consumer is the next block in
    /// program order; a block with no consumer can only stay at the root.
    ///
    /// This is re-derived from live state on every call. Consumer loop
    /// splits change the answer between replays, so legality is never cached.
    pub fn collect_compute_locations(&self, block: BlockId) -> Vec<i64> {
        let Some(consumer) = self.blocks.get(block + 1) else {
            return vec![-1];
        };
        let mut locs = vec![-2, -1];
        locs.extend(0..consumer.loops.len() as i64);
        locs
    }

    pub fn set_compute_at(&mut self, block: BlockId, loc_index: i64) -> Result<(), ScheduleError> {
        let legal = self.collect_compute_locations(block);
        let loc = ComputeLoc::from_index(loc_index).filter(|_| legal.contains(&loc_index));
        let Some(loc) = loc else {
            return Err(ScheduleError::IllegalDecision {
                kind: "SampleComputeLocation",
                detail: format!("location {} not in legal set {:?}", loc_index, legal),
            });
        };
        self.blocks[block].compute_at = loc;
        Ok(())
    }

    /// Splits the loop at `loop_idx` into one loop per factor. The factors
    /// must multiply back to the loop's current extent.
    pub fn split_loop(
        &mut self,
        block: BlockId,
        loop_idx: usize,
        factors: &[i64],
    ) -> Result<(), ScheduleError> {
        let state = &self.blocks[block];
        if loop_idx >= state.loops.len() {
            return Err(ScheduleError::LoopOutOfRange {
                block: state.name.clone(),
                index: loop_idx,
                len: state.loops.len(),
            });
        }
        let extent = state.loops[loop_idx].extent;
        if factors.is_empty() || factors.iter().any(|&f| f < 1) {
            return Err(ScheduleError::IllegalDecision {
                kind: "SamplePerfectTile",
                detail: format!("factors {:?} must be non-empty and positive", factors),
            });
        }
        if factors.iter().product::<i64>() != extent {
            return Err(ScheduleError::IllegalDecision {
                kind: "SamplePerfectTile",
                detail: format!("factors {:?} do not multiply to extent {}", factors, extent),
            });
        }
        let name = state.name.clone();
        let block_state = &mut self.blocks[block];
        block_state.loops.remove(loop_idx);
        for (i, &f) in factors.iter().enumerate() {
            block_state.loops.insert(loop_idx + i, LoopState { extent: f });
        }
        log::trace!("split loop {} of block {:?} into {:?}", loop_idx, name, factors);
        Ok(())
    }

    pub fn vectorize_innermost(&mut self, block: BlockId) -> Result<(), ScheduleError> {
        let state = &mut self.blocks[block];
        if state.loops.is_empty() {
            return Err(ScheduleError::LoopOutOfRange {
                block: state.name.clone(),
                index: 0,
                len: 0,
            });
        }
        state.vectorized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BlockDef, IrModule, PrimFunc};
    use smallvec::smallvec;

    fn two_block_module() -> IrModule {
        IrModule::new(vec![(
            "main".to_owned(),
            PrimFunc {
                params: vec![],
                is_entry: true,
                body: vec![
                    BlockDef {
                        name: "producer".to_owned(),
                        loop_extents: smallvec![16, 16],
                        layout_rewrite_preproc: false,
                    },
                    BlockDef {
                        name: "consumer".to_owned(),
                        loop_extents: smallvec![16, 16, 8],
                        layout_rewrite_preproc: false,
                    },
                ],
            },
        )])
    }

    #[test]
    fn test_compute_locations_for_producer() {
        let sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let b = sch.get_block("producer").unwrap();
        assert_eq!(sch.collect_compute_locations(b), vec![-2, -1, 0, 1, 2]);
    }

    #[test]
    fn test_last_block_can_only_stay_at_root() {
        let sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let b = sch.get_block("consumer").unwrap();
        assert_eq!(sch.collect_compute_locations(b), vec![-1]);
    }

    #[test]
    fn test_split_changes_consumer_location_set() {
        let mut sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let consumer = sch.get_block("consumer").unwrap();
        sch.split_loop(consumer, 2, &[2, 4]).unwrap();
        let producer = sch.get_block("producer").unwrap();
        assert_eq!(sch.collect_compute_locations(producer), vec![-2, -1, 0, 1, 2, 3]);
    }

    #[test]
    fn test_split_rejects_imperfect_factors() {
        let mut sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let b = sch.get_block("consumer").unwrap();
        assert!(matches!(
            sch.split_loop(b, 0, &[3, 4]),
            Err(ScheduleError::IllegalDecision { .. })
        ));
    }

    #[test]
    fn test_split_rejects_stale_loop_index() {
        let mut sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let b = sch.get_block("producer").unwrap();
        assert!(matches!(
            sch.split_loop(b, 5, &[4, 4]),
            Err(ScheduleError::LoopOutOfRange { .. })
        ));
    }

    #[test]
    fn test_set_compute_at_validates_against_live_set() {
        let mut sch = Schedule::new(&two_block_module(), RandState::new(0)).unwrap();
        let b = sch.get_block("producer").unwrap();
        sch.set_compute_at(b, 1).unwrap();
        assert_eq!(sch.blocks()[b].compute_at, ComputeLoc::At(1));
        assert!(sch.set_compute_at(b, 7).is_err());
    }
}
