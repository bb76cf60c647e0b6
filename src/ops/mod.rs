//! Operational commands run against a live cluster

pub mod benchmark;

pub use benchmark::{run_benchmark, BenchmarkReport, TransferTiming};
