pub mod arginfo;
pub mod codegen;
pub mod common;
pub mod measure;
pub mod module;
pub mod randstate;
pub mod sched;
pub mod scheduler;
pub mod search;
pub mod target;
pub mod trace;
pub mod utils;
pub mod workload;
