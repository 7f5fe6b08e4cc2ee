//! Demo workload modules and their schedule-space skeletons.

use smallvec::smallvec;

use crate::common::{AttrValue, Dtype};
use crate::module::{BlockDef, Buffer, IrModule, Param, PrimFunc};
use crate::sched::ScheduleError;
use crate::trace::{InstructionKind, Operand, Trace, TraceBuilder};

fn tensor_param(name: &str, dtype: Dtype, shape: &[i64]) -> Param {
    Param {
        name: name.to_owned(),
        buffer: Some(Buffer {
            dtype,
            shape: shape.iter().copied().collect(),
        }),
    }
}

/// A matrix multiplication `C[m,n] = A[m,k] * B[k,n]`: an init block zeroing
/// the output and an update block accumulating over `k`.
pub fn matmul(m: i64, n: i64, k: i64) -> IrModule {
    IrModule::new(vec![(
        "main".to_owned(),
        PrimFunc {
            params: vec![
                tensor_param("A", Dtype::Float32, &[m, k]),
                tensor_param("B", Dtype::Float32, &[k, n]),
                tensor_param("C", Dtype::Float32, &[m, n]),
            ],
            is_entry: true,
            body: vec![
                BlockDef {
                    name: "init".to_owned(),
                    loop_extents: smallvec![m, n],
                    layout_rewrite_preproc: false,
                },
                BlockDef {
                    name: "update".to_owned(),
                    loop_extents: smallvec![m, n, k],
                    layout_rewrite_preproc: false,
                },
            ],
        },
    )])
}

/// A small convolution with a weight-layout-rewrite preprocessing block, to
/// exercise the preproc strip in descriptor extraction.
pub fn conv2d(batch: i64, channels: i64, filters: i64, size: i64, ksize: i64) -> IrModule {
    let out_size = size - ksize + 1;
    IrModule::new(vec![(
        "main".to_owned(),
        PrimFunc {
            params: vec![
                tensor_param("data", Dtype::Float32, &[batch, channels, size, size]),
                tensor_param("weight", Dtype::Float32, &[filters, channels, ksize, ksize]),
                tensor_param("out", Dtype::Float32, &[batch, filters, out_size, out_size]),
            ],
            is_entry: true,
            body: vec![
                BlockDef {
                    name: "weight_rewrite".to_owned(),
                    loop_extents: smallvec![filters, channels, ksize, ksize],
                    layout_rewrite_preproc: true,
                },
                BlockDef {
                    name: "conv".to_owned(),
                    loop_extents: smallvec![batch, filters, out_size, out_size, channels],
                    layout_rewrite_preproc: false,
                },
            ],
        },
    )])
}

/// Builds the decision-less schedule skeleton for a module: per block, an
/// innermost-loop split and a compute-location sample, plus a trailing
/// vectorize on the final block. Replaying the skeleton samples concrete
/// decisions from the schedule's random stream.
pub fn schedule_skeleton(mod_: &IrModule) -> Result<Trace, ScheduleError> {
    let get_block = InstructionKind::get("GetBlock")?;
    let tile = InstructionKind::get("SamplePerfectTile")?;
    let compute_location = InstructionKind::get("SampleComputeLocation")?;
    let vectorize = InstructionKind::get("Vectorize")?;

    let func = mod_.entry_func()?;
    let mut builder = TraceBuilder::new();
    let mut last_block_rv = None;
    for block in &func.body {
        let rvs = builder.push(
            get_block,
            Vec::new(),
            [AttrValue::Str(block.name.clone())],
            None,
        );
        let block_rv = rvs[0];
        if !block.loop_extents.is_empty() {
            builder.push(
                tile,
                [Operand::Out(block_rv)],
                [
                    AttrValue::Int(block.loop_extents.len() as i64 - 1),
                    AttrValue::Int(2),
                    AttrValue::Int(16),
                ],
                None,
            );
        }
        builder.push(compute_location, [Operand::Out(block_rv)], Vec::new(), None);
        last_block_rv = Some(block_rv);
    }
    if let Some(rv) = last_block_rv {
        builder.push(vectorize, [Operand::Out(rv)], Vec::new(), None);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arginfo::ArgInfo;

    #[test]
    fn test_matmul_has_three_tensor_args() {
        let infos = ArgInfo::from_entry_func(&matmul(8, 8, 8), false).unwrap();
        assert_eq!(infos.len(), 3);
    }

    #[test]
    fn test_skeleton_ends_with_postproc() {
        let trace = schedule_skeleton(&matmul(8, 8, 8)).unwrap();
        assert!(trace.insts().last().unwrap().kind.is_postproc());
    }
}
