//! Integration tests for whole dataset reductions on both backends.

mod common;

use chunkreduce::error::ReductionError;
use chunkreduce::operations::{Max, Sum};
use chunkreduce::pipeline::reduce_dataset;
use chunkreduce::scheduler::Backend;

use common::{config, processes, write_spike_dataset};

#[tokio::test]
async fn test_spike_found_by_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let reduction = reduce_dataset::<Max>(&paths, &[], &config(processes(), 2, 100))
        .await
        .unwrap();
    assert_eq!(vec![5.0_f32], reduction.values::<f32>().unwrap());
    assert_eq!(vec![30000], reduction.counts);
    assert!(reduction.shape.is_empty());
}

#[tokio::test]
async fn test_backends_agree() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let dims = vec!["time".to_string(), "lon".to_string()];
    let threads = reduce_dataset::<Sum>(&paths, &dims, &config(Backend::Threads, 3, 40))
        .await
        .unwrap();
    let processes = reduce_dataset::<Sum>(&paths, &dims, &config(processes(), 3, 40))
        .await
        .unwrap();
    assert_eq!(vec![10], threads.shape);
    assert_eq!(threads.shape, processes.shape);
    assert_eq!(threads.counts, processes.counts);
    assert_eq!(
        threads.values::<f32>().unwrap(),
        processes.values::<f32>().unwrap()
    );
    let mut expected = vec![0.0_f32; 10];
    expected[4] = 5.0;
    assert_eq!(expected, threads.values::<f32>().unwrap());
}

#[tokio::test]
async fn test_worker_count_invariance() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let dims = vec!["lat".to_string()];
    let mut results = vec![];
    for backend in [Backend::Threads, processes()] {
        for worker_count in [1, 2, 4] {
            let reduction =
                reduce_dataset::<Max>(&paths, &dims, &config(backend.clone(), worker_count, 30))
                    .await
                    .unwrap();
            results.push(reduction);
        }
    }
    for result in &results[1..] {
        assert_eq!(results[0].shape, result.shape);
        assert_eq!(results[0].body, result.body);
        assert_eq!(results[0].counts, result.counts);
    }
    assert_eq!(vec![300, 10], results[0].shape);
    assert_eq!(vec!["time".to_string(), "lon".to_string()], results[0].dimensions);
}

#[tokio::test]
async fn test_chunk_size_invariance() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let small = reduce_dataset::<Max>(&paths, &[], &config(Backend::Threads, 4, 1))
        .await
        .unwrap();
    let large = reduce_dataset::<Max>(&paths, &[], &config(processes(), 2, 1000))
        .await
        .unwrap();
    assert_eq!(small.body, large.body);
    assert_eq!(small.counts, large.counts);
}

#[tokio::test]
async fn test_io_failure_in_worker_process() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    // Cut the last file short so that its second half cannot be read.
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&paths[2])
        .unwrap();
    let length = file.metadata().unwrap().len();
    file.set_len(length - 50 * 100 * 4).unwrap();
    match reduce_dataset::<Max>(&paths, &[], &config(processes(), 2, 50))
        .await
        .unwrap_err()
    {
        ReductionError::Io { path, chunk, .. } => {
            assert_eq!(paths[2], path);
            assert_eq!(Some(5), chunk);
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[tokio::test]
async fn test_history_records_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let reduction = reduce_dataset::<Max>(&paths, &[], &config(Backend::Threads, 2, 100))
        .await
        .unwrap();
    let history = &reduction.attributes["history"];
    assert!(history.contains(": chunkreduce reduce"));
    for i in 0..3 {
        assert!(history.contains(&format!("created file {}", i)));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_process_exits() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    let backend = Backend::Processes {
        program: "/bin/true".into(),
    };
    match reduce_dataset::<Max>(&paths, &[], &config(backend, 1, 100))
        .await
        .unwrap_err()
    {
        ReductionError::WorkerFailure { chunk, reason } => {
            assert!(chunk < 3, "chunk {}", chunk);
            assert!(!reason.is_empty());
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_process_breaks_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let paths = write_spike_dataset(dir.path());
    // Prints "worker" instead of a JSON response, then exits.
    let backend = Backend::Processes {
        program: "/bin/echo".into(),
    };
    assert!(matches!(
        reduce_dataset::<Max>(&paths, &[], &config(backend, 1, 100))
            .await
            .unwrap_err(),
        ReductionError::WorkerFailure { .. }
    ));
}
