//! Structured execution patterns
//!
//! Map-reduce with bounded concurrency, and subworkflow composition
//! (single child, parallel set, scatter-gather, race, fallback).

mod map_reduce;
mod subworkflow;

pub use map_reduce::{
    run_map, run_map_reduce, run_map_streaming, run_reduce, ItemOutcome, MapConfig,
    MapProgress, MapReduceConfig, ReduceConfig,
};
pub use subworkflow::{
    fallback, parallel_subworkflows, race, run_subworkflow, scatter_gather, ChildSpec,
    InputMapper, SubworkflowConfig, SubworkflowErrorStrategy, DEFAULT_MAX_DEPTH,
};
