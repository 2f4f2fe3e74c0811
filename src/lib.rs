//! This crate performs reductions such as max, min and sum over datasets that are split across
//! many array files and too large to fit in memory.
//!
//! The files are treated as one logical array concatenated along one dimension. That dimension is
//! split into chunks, each chunk is loaded and reduced by a worker, and the partial results are
//! combined as they arrive. Workers are threads of a pool or separate processes, and the number of
//! chunks in flight is bounded so that memory use does not grow with the size of the dataset.
//!
//! The crate is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, drives scheduling and worker
//!   processes.
//! * [Rayon](rayon) provides the thread pool on which chunk tasks run.
//! * [Serde](serde) performs (de)serialisation of file headers and the worker protocol.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used in numerical
//!   computation.

pub mod app;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod format;
pub mod loader;
pub mod models;
pub mod operation;
pub mod operations;
pub mod pipeline;
pub mod planner;
pub mod provenance;
pub mod resource_manager;
pub mod scheduler;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod worker;
