//! Common test utilities
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use chunkreduce::format::{write_array_file, ArrayHeader};
use chunkreduce::models::{DType, Dimension};
use chunkreduce::pipeline::PipelineConfig;
use chunkreduce::scheduler::{Backend, SchedulerConfig};

/// Path of the chunkreduce binary built for these tests
pub fn program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chunkreduce"))
}

/// Write 3 files of 100 time steps on a 10x10 grid.
///
/// Every element is zero except for a single 5.0 at time step 150.
pub fn write_spike_dataset(dir: &Path) -> Vec<PathBuf> {
    let spike = 150 * 100 + 42;
    (0..3)
        .map(|i| {
            let path = dir.join(format!("tas_{}.arr", i));
            let header = ArrayHeader::new(
                "tas",
                DType::Float32,
                vec![
                    Dimension::new("time", 100),
                    Dimension::new("lat", 10),
                    Dimension::new("lon", 10),
                ],
            )
            .with_attribute("history", format!("created file {}", i));
            let data: Vec<f32> = (0..100 * 100)
                .map(|j| if i * 100 * 100 + j == spike { 5.0 } else { 0.0 })
                .collect();
            write_array_file(&path, &header, &data).unwrap();
            path
        })
        .collect()
}

/// Pipeline configuration for a backend and worker count
pub fn config(backend: Backend, worker_count: usize, chunk_size: usize) -> PipelineConfig {
    PipelineConfig {
        chunk_size,
        scheduler: SchedulerConfig {
            worker_count,
            backend,
            ..Default::default()
        },
        command: vec!["chunkreduce".to_string(), "reduce".to_string()],
        ..Default::default()
    }
}

/// Process backend using the test binary
pub fn processes() -> Backend {
    Backend::Processes { program: program() }
}
