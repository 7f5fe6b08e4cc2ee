//! C emission for the local builder.
//!
//! This is measurement plumbing, not a compiler backend: it renders the
//! scheduled loop nests as a self-timing C program whose runtime scales with
//! the loop structure the schedule chose. Blocks are emitted in program
//! order; the timed region reports the best of `timer-repeats` repetitions
//! in nanoseconds on stdout.

use std::fmt;

use crate::arginfo::ArgInfo;
use crate::sched::Schedule;
use crate::target::Target;

const DEFAULT_REPEATS: i64 = 16;

pub fn emit<W: fmt::Write>(
    out: &mut W,
    sch: &Schedule,
    args_info: &[ArgInfo],
    target: &Target,
) -> fmt::Result {
    let repeats = target.attr_int("timer-repeats").unwrap_or(DEFAULT_REPEATS);

    writeln!(out, "#include <stdint.h>")?;
    writeln!(out, "#include <stdio.h>")?;
    writeln!(out, "#include <stdlib.h>")?;
    writeln!(out, "#include <time.h>")?;
    writeln!(out)?;
    writeln!(out, "static int64_t now_ns(void) {{")?;
    writeln!(out, "  struct timespec ts;")?;
    writeln!(out, "  clock_gettime(CLOCK_MONOTONIC, &ts);")?;
    writeln!(
        out,
        "  return (int64_t)ts.tv_sec * 1000000000 + ts.tv_nsec;"
    )?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    writeln!(out, "int main(void) {{")?;

    for (i, info) in args_info.iter().enumerate() {
        let ArgInfo::Tensor(t) = info;
        let elems: i64 = t.shape.iter().product();
        writeln!(
            out,
            "  {ty}* arg{i} = calloc({elems}, sizeof({ty}));",
            ty = t.dtype.c_type(),
        )?;
    }
    writeln!(out, "  volatile double sink = 0.0;")?;
    writeln!(out, "  int64_t best = INT64_MAX;")?;
    writeln!(out, "  for (int rep = 0; rep < {}; rep++) {{", repeats)?;
    writeln!(out, "    int64_t t0 = now_ns();")?;

    for (b, block) in sch.blocks().iter().enumerate() {
        writeln!(
            out,
            "    /* block {} (compute_at {}) */",
            block.name,
            block.compute_at.index()
        )?;
        let mut depth = 0;
        for (l, loop_state) in block.loops.iter().enumerate() {
            let indent = "  ".repeat(2 + depth);
            if block.vectorized && l == block.loops.len() - 1 {
                writeln!(out, "{}#pragma clang loop vectorize(enable)", indent)?;
            }
            writeln!(
                out,
                "{}for (int64_t i{}_{} = 0; i{}_{} < {}; i{}_{}++) {{",
                indent, b, l, b, l, loop_state.extent, b, l
            )?;
            depth += 1;
        }
        let indent = "  ".repeat(2 + depth);
        let index: String = (0..block.loops.len())
            .map(|l| format!("i{}_{}", b, l))
            .collect::<Vec<_>>()
            .join(" + ");
        let index = if index.is_empty() { "0".to_owned() } else { index };
        for i in 0..args_info.len() {
            let ArgInfo::Tensor(t) = &args_info[i];
            let elems: i64 = t.shape.iter().product::<i64>().max(1);
            writeln!(out, "{}sink += (double)arg{}[({}) % {}];", indent, i, index, elems)?;
        }
        for d in (0..depth).rev() {
            writeln!(out, "{}}}", "  ".repeat(2 + d))?;
        }
    }

    writeln!(out, "    int64_t elapsed = now_ns() - t0;")?;
    writeln!(out, "    if (elapsed < best) best = elapsed;")?;
    writeln!(out, "  }}")?;
    writeln!(out, "  printf(\"%lld\\n\", (long long)best);")?;
    for i in 0..args_info.len() {
        writeln!(out, "  free(arg{});", i)?;
    }
    writeln!(out, "  return (int)(sink == -1.0);")?;
    writeln!(out, "}}")
}
