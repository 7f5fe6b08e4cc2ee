use serde_json::{json, Value as Json};

use crate::common::Dtype;
use crate::module::{EntryFuncError, IrModule, PrimFunc};

const TENSOR_TAG: &str = "TENSOR";

/// A structured description of one runtime argument of a candidate program,
/// used to synthesize measurement inputs. Dispatch is by the string tag
/// leading the serialized form.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgInfo {
    Tensor(TensorInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub dtype: Dtype,
    pub shape: Vec<i64>,
}

#[derive(thiserror::Error, Debug)]
pub enum ArgInfoError {
    #[error("unable to parse the JSON object: {payload}\nThe error is: {reason}")]
    Parse { payload: String, reason: String },
    #[error("unsupported argument type: {param} is not bound to a buffer")]
    UnsupportedArgument { param: String },
    #[error(transparent)]
    Entry(#[from] EntryFuncError),
}

impl ArgInfo {
    /// Serializes to the tagged array form, e.g.
    /// `["TENSOR", "float32", [1, 224, 224, 3]]`.
    pub fn as_json(&self) -> Json {
        match self {
            ArgInfo::Tensor(info) => info.as_json(),
        }
    }

    pub fn from_json(json: &Json) -> Result<ArgInfo, ArgInfoError> {
        let tag = json
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Json::as_str)
            .ok_or_else(|| parse_err(json, "expected a non-empty array with a string tag"))?;
        match tag {
            TENSOR_TAG => Ok(ArgInfo::Tensor(TensorInfo::from_json(json)?)),
            other => Err(parse_err(json, &format!("unknown tag {:?}", other))),
        }
    }

    /// Derives one descriptor per parameter of `func`. Parameters not bound
    /// to a buffer are unsupported.
    pub fn from_prim_func(func: &PrimFunc) -> Result<Vec<ArgInfo>, ArgInfoError> {
        func.params
            .iter()
            .map(|param| match &param.buffer {
                Some(buffer) => Ok(ArgInfo::Tensor(TensorInfo {
                    dtype: buffer.dtype,
                    shape: buffer.shape.to_vec(),
                })),
                None => Err(ArgInfoError::UnsupportedArgument {
                    param: param.name.clone(),
                }),
            })
            .collect()
    }

    /// Derives descriptors from the module's entry function, optionally
    /// stripping weight-layout-rewrite preprocessing blocks first.
    pub fn from_entry_func(mod_: &IrModule, remove_preproc: bool) -> Result<Vec<ArgInfo>, ArgInfoError> {
        if remove_preproc {
            let stripped = mod_.without_layout_rewrite_blocks();
            return ArgInfo::from_prim_func(stripped.entry_func()?);
        }
        ArgInfo::from_prim_func(mod_.entry_func()?)
    }
}

impl TensorInfo {
    pub fn as_json(&self) -> Json {
        json!([TENSOR_TAG, self.dtype.to_string(), self.shape])
    }

    pub fn from_json(json: &Json) -> Result<TensorInfo, ArgInfoError> {
        let arr = json
            .as_array()
            .filter(|arr| arr.len() == 3)
            .ok_or_else(|| parse_err(json, "expected an array of exactly 3 elements"))?;
        let dtype = arr[1]
            .as_str()
            .ok_or_else(|| parse_err(json, "dtype must be a string"))?
            .parse::<Dtype>()
            .map_err(|e| parse_err(json, &e.to_string()))?;
        let shape = arr[2]
            .as_array()
            .ok_or_else(|| parse_err(json, "shape must be an array"))?
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| parse_err(json, "shape entries must be int64")))
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(TensorInfo { dtype, shape })
    }

    /// Total buffer size in bytes.
    pub fn size_bytes(&self) -> i64 {
        self.shape.iter().product::<i64>() * i64::from(self.dtype.size())
    }
}

fn parse_err(payload: &Json, reason: &str) -> ArgInfoError {
    ArgInfoError::Parse {
        payload: payload.to_string(),
        reason: reason.to_owned(),
    }
}
