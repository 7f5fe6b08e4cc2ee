use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub type DimSize = i64;
pub type Shape = smallvec::SmallVec<[DimSize; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Dtype {
    Float16,
    Float32,
    Int8,
    Int32,
    Int64,
    Uint8,
}

/// A literal value carried by an instruction attribute or a target attribute.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match &self {
            Dtype::Float16 => 2,
            Dtype::Float32 => 4,
            Dtype::Int8 => 1,
            Dtype::Int32 => 4,
            Dtype::Int64 => 8,
            Dtype::Uint8 => 1,
        }
    }

    pub fn c_type(&self) -> &'static str {
        match self {
            Dtype::Float16 => "_Float16",
            Dtype::Float32 => "float",
            Dtype::Int8 => "int8_t",
            Dtype::Int32 => "int32_t",
            Dtype::Int64 => "int64_t",
            Dtype::Uint8 => "uint8_t",
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float16 => write!(f, "float16"),
            Dtype::Float32 => write!(f, "float32"),
            Dtype::Int8 => write!(f, "int8"),
            Dtype::Int32 => write!(f, "int32"),
            Dtype::Int64 => write!(f, "int64"),
            Dtype::Uint8 => write!(f, "uint8"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("unknown dtype: {0}")]
pub struct DtypeParseError(pub String);

impl FromStr for Dtype {
    type Err = DtypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float16" => Ok(Dtype::Float16),
            "float32" => Ok(Dtype::Float32),
            "int8" => Ok(Dtype::Int8),
            "int32" => Ok(Dtype::Int32),
            "int64" => Ok(Dtype::Int64),
            "uint8" => Ok(Dtype::Uint8),
            other => Err(DtypeParseError(other.to_owned())),
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Str(s) => write!(f, "{:?}", s),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}
