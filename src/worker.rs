//! Chunk tasks and worker processes.
//!
//! A chunk task loads one chunk and reduces it to a [PartialResult]. Tasks run either on a thread
//! of the scheduler's pool, via [execute_task], or in a worker process.
//!
//! Worker processes are the `chunkreduce worker` subcommand. They read one JSON request per line
//! from stdin and write one JSON response per line to stdout, handling one task at a time. Only
//! built-in operators can be run this way since the operator is selected by name.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{ReductionError, TaskFailure};
use crate::loader::{load, BlockLayout};
use crate::models::{NanPolicy, Operation, PartialResult};
use crate::operation::{Element, NumDispatch, Reducer};
use crate::operations::{reduce_block, Max, Min, Sum, ValueFilter};
use crate::planner::ChunkDescriptor;
use crate::types::{DValue, Missing};

/// Everything a task needs besides its chunk. Shared by all tasks of one execution.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TaskSpec {
    /// Name of the operator
    pub operation: String,
    /// Layout of the dataset
    pub layout: BlockLayout,
    /// Axes to reduce over, in increasing order
    pub axes: Vec<usize>,
    /// Missing data descriptor
    pub missing: Option<Missing<DValue>>,
    /// NaN handling
    pub nan_policy: NanPolicy,
}

impl TaskSpec {
    /// Returns a new TaskSpec for operator `R`.
    pub fn new<R: Reducer>(
        layout: BlockLayout,
        axes: Vec<usize>,
        missing: Option<Missing<DValue>>,
        nan_policy: NanPolicy,
    ) -> Self {
        Self {
            operation: R::NAME.to_string(),
            layout,
            axes,
            missing,
            nan_policy,
        }
    }

    /// Shape of the result of reducing the whole dataset.
    pub fn output_shape(&self) -> Vec<usize> {
        self.layout
            .shape
            .iter()
            .enumerate()
            .filter(|(axis, _)| !self.axes.contains(axis))
            .map(|(_, size)| *size)
            .collect()
    }

    /// Whether the concatenation dimension is one of the reduced axes.
    pub fn reduces_concat_axis(&self) -> bool {
        self.axes.contains(&self.layout.concat_axis)
    }
}

/// Load and reduce one chunk.
struct ChunkTask<'a, R> {
    spec: &'a TaskSpec,
    descriptor: &'a ChunkDescriptor,
    _reducer: PhantomData<R>,
}

impl<'a, R: Reducer> NumDispatch for ChunkTask<'a, R> {
    type Output = PartialResult;

    fn run_t<T: Element>(self) -> Result<PartialResult, ReductionError> {
        let missing = self
            .spec
            .missing
            .as_ref()
            .map(Missing::<T>::try_from)
            .transpose()?;
        let filter = ValueFilter::new(missing, self.spec.nan_policy);
        let block = load::<T>(&self.spec.layout, self.descriptor, &self.spec.axes)?;
        let cells = reduce_block::<R, T>(block.array.view(), &block.axes, &filter)?;
        Ok(PartialResult::from_cells(
            block.chunk,
            self.spec.layout.dtype,
            &cells,
        ))
    }
}

/// Run a chunk task with operator `R`.
pub fn execute_task<R: Reducer>(
    spec: &TaskSpec,
    descriptor: &ChunkDescriptor,
) -> Result<PartialResult, ReductionError> {
    ChunkTask::<R> {
        spec,
        descriptor,
        _reducer: PhantomData,
    }
    .run(spec.layout.dtype)
}

/// Run a chunk task with the built-in operator named in the spec.
pub fn execute_builtin(
    spec: &TaskSpec,
    descriptor: &ChunkDescriptor,
) -> Result<PartialResult, ReductionError> {
    match Operation::from_name(&spec.operation) {
        Some(Operation::Max) => execute_task::<Max>(spec, descriptor),
        Some(Operation::Min) => execute_task::<Min>(spec, descriptor),
        Some(Operation::Sum) => execute_task::<Sum>(spec, descriptor),
        None => Err(ReductionError::UnsupportedOperation {
            operation: spec.operation.clone(),
        }),
    }
}

/// Request sent to a worker process
#[derive(Debug, Deserialize)]
struct WorkerRequest {
    spec: TaskSpec,
    descriptor: ChunkDescriptor,
}

/// Borrowed form of [WorkerRequest], for sending.
#[derive(Serialize)]
struct WorkerRequestRef<'a> {
    spec: &'a TaskSpec,
    descriptor: &'a ChunkDescriptor,
}

/// Outcome of a task in a worker process
#[derive(Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Done(PartialResult),
    Failed(TaskFailure),
}

/// Response sent by a worker process
#[derive(Debug, Deserialize, PartialEq, Serialize)]
struct WorkerResponse {
    chunk: usize,
    outcome: TaskOutcome,
}

/// Serve chunk tasks until `reader` is closed.
///
/// Task failures are reported to the caller and do not end the loop. Only errors on the pipes
/// themselves, or an undecodable request, are returned.
pub async fn serve<R, W>(reader: R, mut writer: W) -> Result<(), ReductionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.map_err(ReductionError::WorkerPipe)? {
        let request: WorkerRequest = serde_json::from_str(&line)?;
        let chunk = request.descriptor.id;
        tracing::debug!(chunk, "received task");
        let result = tokio::task::spawn_blocking(move || {
            execute_builtin(&request.spec, &request.descriptor)
        })
        .await;
        let outcome = match result {
            Ok(Ok(partial)) => TaskOutcome::Done(partial),
            Ok(Err(error)) => TaskOutcome::Failed(TaskFailure::from(&error)),
            Err(join_error) => TaskOutcome::Failed(TaskFailure::Other {
                error: crate::error::ErrorBody::new(&join_error),
            }),
        };
        let mut response = serde_json::to_vec(&WorkerResponse { chunk, outcome })?;
        response.push(b'\n');
        writer
            .write_all(&response)
            .await
            .map_err(ReductionError::WorkerPipe)?;
        writer.flush().await.map_err(ReductionError::WorkerPipe)?;
    }
    Ok(())
}

/// A worker process, seen from the coordinator.
///
/// The process is killed if this is dropped while a task is in flight.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    /// Start `program worker`.
    pub fn spawn(program: &Path) -> Result<Self, ReductionError> {
        let spawn_error = |source| ReductionError::WorkerSpawn {
            program: program.to_path_buf(),
            source,
        };
        let mut child = Command::new(program)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker pipes unavailable",
            )));
        };
        tracing::debug!(pid = ?child.id(), "started worker process");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Run one task in the process.
    ///
    /// A task failure reported by the process is returned as an outcome. Any other error means
    /// the process must not be reused.
    pub async fn run(
        &mut self,
        spec: &TaskSpec,
        descriptor: &ChunkDescriptor,
    ) -> Result<TaskOutcome, ReductionError> {
        let chunk = descriptor.id;
        let failure = |reason: String| ReductionError::WorkerFailure { chunk, reason };
        let mut request = serde_json::to_vec(&WorkerRequestRef { spec, descriptor })?;
        request.push(b'\n');
        self.stdin
            .write_all(&request)
            .await
            .map_err(|err| failure(format!("failed to send task: {}", err)))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| failure(format!("failed to send task: {}", err)))?;
        let line = self
            .stdout
            .next_line()
            .await
            .map_err(|err| failure(format!("failed to receive result: {}", err)))?
            .ok_or_else(|| failure("worker process exited".to_string()))?;
        let response: WorkerResponse = serde_json::from_str(&line)
            .map_err(|err| failure(format!("invalid response: {}", err)))?;
        if response.chunk != chunk {
            return Err(failure(format!(
                "response is for chunk {}",
                response.chunk
            )));
        }
        Ok(response.outcome)
    }

    /// Close the process's stdin and wait for it to exit.
    pub async fn shutdown(self) -> Result<(), ReductionError> {
        let Self {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        child.wait().await.map_err(ReductionError::WorkerPipe)?;
        Ok(())
    }
}

/// Path of the worker program: the running executable.
pub fn current_program() -> Result<PathBuf, ReductionError> {
    std::env::current_exe().map_err(|source| ReductionError::WorkerSpawn {
        program: PathBuf::from("chunkreduce"),
        source,
    })
}
