use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display};

use crate::common::AttrValue;

/// A registered device class ("cpu", "gpu"). Each kind carries a bag of
/// default attributes; registrations at a higher priority level shadow lower
/// ones for the same key. The registry is populated once at startup and
/// read-only thereafter.
#[derive(Clone, Copy)]
pub struct TargetKind(&'static TargetKindEntry);

struct TargetKindEntry {
    name: &'static str,
    /// (key, value, priority level); highest plevel per key wins.
    attrs: &'static [(&'static str, AttrValue, i32)],
}

/// A concrete target: a kind plus its resolved attribute values. Consumed
/// read-only during build and run to determine device-specific defaults.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Target {
    kind: String,
    attrs: BTreeMap<String, AttrValue>,
}

#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    #[error("unknown target kind: {0}")]
    UnknownKind(String),
}

lazy_static! {
    static ref TARGET_KINDS: HashMap<&'static str, TargetKind> = {
        static CPU: TargetKindEntry = TargetKindEntry {
            name: "cpu",
            attrs: &[
                ("num-cores", AttrValue::Int(4), 0),
                ("vector-width", AttrValue::Int(128), 0),
                // Parser-refined value shadows the generic default.
                ("vector-width", AttrValue::Int(256), 10),
                ("timer-repeats", AttrValue::Int(16), 0),
            ],
        };
        static GPU: TargetKindEntry = TargetKindEntry {
            name: "gpu",
            attrs: &[
                ("max-threads-per-block", AttrValue::Int(1024), 0),
                ("shared-memory-bytes", AttrValue::Int(49152), 0),
                ("timer-repeats", AttrValue::Int(64), 0),
            ],
        };
        let mut m = HashMap::new();
        for entry in [&CPU, &GPU] {
            m.insert(entry.name, TargetKind(entry));
        }
        m
    };
}

impl TargetKind {
    pub fn get(name: &str) -> Option<TargetKind> {
        TARGET_KINDS.get(name).copied()
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn list() -> Vec<&'static str> {
        let mut names: Vec<_> = TARGET_KINDS.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Debug for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl Target {
    /// Snapshots the kind's defaults, resolving duplicate keys by priority
    /// level.
    pub fn new(kind_name: &str) -> Result<Target, TargetError> {
        let kind = TargetKind::get(kind_name)
            .ok_or_else(|| TargetError::UnknownKind(kind_name.to_owned()))?;
        let mut resolved: BTreeMap<String, (AttrValue, i32)> = BTreeMap::new();
        for (key, value, plevel) in kind.0.attrs {
            match resolved.get(*key) {
                Some((_, existing)) if *existing >= *plevel => {}
                _ => {
                    resolved.insert((*key).to_owned(), (value.clone(), *plevel));
                }
            }
        }
        Ok(Target {
            kind: kind.name().to_owned(),
            attrs: resolved.into_iter().map(|(k, (v, _))| (k, v)).collect(),
        })
    }

    /// Overrides one attribute; user-supplied values outrank any default.
    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Target {
        self.attrs.insert(key.to_owned(), value);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}
