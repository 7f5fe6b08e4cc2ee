use serde::{Deserialize, Serialize};
use std::fmt::Display;

use smallvec::SmallVec;

use crate::common::{Dtype, Shape};

/// A module of tensor-program functions. This is the read-only workload
/// handed to a tuning task; the search never mutates it, and every replay
/// materializes fresh schedule state from it.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct IrModule {
    functions: Vec<(String, PrimFunc)>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct PrimFunc {
    pub params: Vec<Param>,
    pub is_entry: bool,
    pub body: Vec<BlockDef>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Param {
    pub name: String,
    /// The buffer this parameter is bound to. Parameters without a buffer
    /// binding cannot be described for measurement.
    pub buffer: Option<Buffer>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Buffer {
    pub dtype: Dtype,
    pub shape: Shape,
}

/// One computation block: a named loop nest over the given extents.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct BlockDef {
    pub name: String,
    pub loop_extents: SmallVec<[i64; 4]>,
    /// Marks a weight-layout-rewrite preprocessing block. These are codegen
    /// conveniences, not semantic inputs, and are stripped before argument
    /// inspection.
    pub layout_rewrite_preproc: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum EntryFuncError {
    #[error("cannot find any function in the module: {0}")]
    NoFunctions(String),
    #[error("multiple functions exist in the module, but none is flagged as the entry: {0}")]
    AmbiguousEntry(String),
}

impl IrModule {
    pub fn new(functions: Vec<(String, PrimFunc)>) -> Self {
        IrModule { functions }
    }

    /// Finds the tuning entry function. Priority: (1) the function flagged as
    /// entry, (2) a function named "main", (3) the sole function. Zero or
    /// multiple untagged candidates is a configuration error.
    pub fn entry_func(&self) -> Result<&PrimFunc, EntryFuncError> {
        let mut main_func = None;
        for (name, func) in &self.functions {
            if func.is_entry {
                return Ok(func);
            }
            if name == "main" {
                main_func = Some(func);
            }
        }
        if let Some(func) = main_func {
            return Ok(func);
        }
        match self.functions.len() {
            0 => Err(EntryFuncError::NoFunctions(self.to_string())),
            1 => Ok(&self.functions[0].1),
            _ => Err(EntryFuncError::AmbiguousEntry(self.to_string())),
        }
    }

    /// Returns a copy with weight-layout-rewrite preprocessing blocks removed
    /// from every function body.
    pub fn without_layout_rewrite_blocks(&self) -> IrModule {
        IrModule {
            functions: self
                .functions
                .iter()
                .map(|(name, func)| {
                    let mut func = func.clone();
                    func.body.retain(|b| !b.layout_rewrite_preproc);
                    (name.clone(), func)
                })
                .collect(),
        }
    }
}

impl Display for IrModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IrModule {{")?;
        for (i, (name, func)) in self.functions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}/{}", name, func.params.len())?;
        }
        write!(f, " }}")
    }
}
