//! Task scheduling.
//!
//! The [Scheduler] runs one chunk task per [ChunkDescriptor] on a fixed pool of workers and
//! combines their partial results as they arrive. At most `worker_count * prefetch_factor` tasks
//! are in flight at once, optionally further limited by the memory their blocks occupy.
//!
//! The first failure stops dispatch, cancels in-flight tasks and is returned. There is no retry.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use ndarray::{ArrayD, Axis, Slice};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_rayon::AsyncThreadPool;
use validator::Validate;

use crate::error::ReductionError;
use crate::models::{DType, Operation, PartialResult};
use crate::operation::{Element, NumDispatch, Reducer};
use crate::operations::{combine_into, verify_contract};
use crate::planner::ChunkDescriptor;
use crate::resource_manager::ResourceManager;
use crate::worker::{execute_task, TaskOutcome, TaskSpec, WorkerProcess};

/// Maximum number of partial values kept for the operator check.
const MAX_SAMPLES: usize = 64;

/// Where chunk tasks run.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Backend {
    /// Threads of a pool owned by the scheduler
    #[default]
    Threads,
    /// Worker processes running `program worker`
    Processes { program: PathBuf },
}

/// Scheduler configuration
#[derive(Clone, Debug, PartialEq, Validate)]
pub struct SchedulerConfig {
    /// Number of workers
    #[validate(range(min = 1, message = "worker count must be greater than 0"))]
    pub worker_count: usize,
    /// Tasks in flight per worker
    #[validate(range(min = 1, message = "prefetch factor must be greater than 0"))]
    pub prefetch_factor: usize,
    /// Where tasks run
    pub backend: Backend,
    /// Limit on the bytes of in-flight blocks
    #[validate(range(min = 1, message = "memory limit must be greater than 0"))]
    pub memory_limit: Option<usize>,
    /// Check partial results for order dependence before returning
    pub verify_operator: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            prefetch_factor: 2,
            backend: Backend::default(),
            memory_limit: None,
            verify_operator: false,
        }
    }
}

/// Counters of the most recent execution.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    dispatched: AtomicUsize,
    completed: AtomicUsize,
}

impl ExecutionStats {
    /// Number of tasks handed to a worker.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Number of partial results combined.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.dispatched.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }
}

/// Runs chunk tasks and combines their results.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    stats: ExecutionStats,
}

impl Scheduler {
    /// Returns a new Scheduler, or an error if the configuration is invalid.
    pub fn new(config: SchedulerConfig) -> Result<Self, ReductionError> {
        config.validate()?;
        Ok(Self {
            config,
            stats: ExecutionStats::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Counters of the most recent call to [Scheduler::execute].
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Reduce every chunk with operator `R` and combine the results.
    ///
    /// Returns the combined result with the reduced axes removed. Its `chunk` is 0.
    ///
    /// When the concatenation dimension is not reduced, each chunk contributes a distinct slice
    /// of the output, which is placed at the chunk's offset rather than folded.
    ///
    /// # Arguments
    ///
    /// * `spec`: What every task does
    /// * `descriptors`: Chunks to reduce
    #[tracing::instrument(
        level = "DEBUG",
        skip_all,
        fields(operation = R::NAME, chunks = descriptors.len())
    )]
    pub async fn execute<R: Reducer>(
        &self,
        spec: TaskSpec,
        descriptors: Vec<ChunkDescriptor>,
    ) -> Result<PartialResult, ReductionError> {
        self.stats.reset();
        if !R::ASSOCIATIVE_COMMUTATIVE {
            return Err(ReductionError::OperatorContractViolation {
                operator: R::NAME.to_string(),
                detail: "operator is not declared associative and commutative".to_string(),
            });
        }
        if descriptors.is_empty() {
            return Err(ReductionError::EmptyDataset);
        }
        let executor = self.executor::<R>()?;
        let mut accumulator = NewAccumulator::<R> {
            spec: &spec,
            verify: self.config.verify_operator,
            _reducer: PhantomData,
        }
        .run(spec.layout.dtype)?;
        let starts: HashMap<usize, usize> = descriptors.iter().map(|d| (d.id, d.start)).collect();
        let resources = ResourceManager::new(
            self.config.memory_limit,
            Some(self.config.worker_count * self.config.prefetch_factor),
        );
        let spec = Arc::new(spec);
        let mut pending = descriptors.into_iter().peekable();
        let mut tasks: JoinSet<Result<PartialResult, ReductionError>> = JoinSet::new();
        let mut in_flight = HashMap::new();

        let outcome = loop {
            let next_size = pending
                .peek()
                .map(|d| spec.layout.block_size(d.length))
                .unwrap_or_default();
            tokio::select! {
                biased;
                Some(joined) = tasks.join_next_with_id() => {
                    let partial = match joined {
                        Ok((id, Ok(partial))) => {
                            in_flight.remove(&id);
                            partial
                        }
                        Ok((id, Err(error))) => {
                            let chunk = in_flight.get(&id).copied().unwrap_or(0);
                            break Err(error.for_chunk(chunk));
                        }
                        Err(join_error) => {
                            let chunk = in_flight.get(&join_error.id()).copied().unwrap_or(0);
                            break Err(ReductionError::WorkerFailure {
                                chunk,
                                reason: join_error.to_string(),
                            });
                        }
                    };
                    let Some(offset) = starts.get(&partial.chunk) else {
                        break Err(ReductionError::WorkerFailure {
                            chunk: partial.chunk,
                            reason: "result for unknown chunk".to_string(),
                        });
                    };
                    if let Err(error) = accumulator.add(*offset, &partial) {
                        break Err(error);
                    }
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(chunk = partial.chunk, "combined partial result");
                }
                permits = resources.permits(next_size), if pending.peek().is_some() => {
                    let permits = match permits {
                        Ok(permits) => permits,
                        Err(error) => break Err(error),
                    };
                    let Some(descriptor) = pending.next() else {
                        continue;
                    };
                    let chunk = descriptor.id;
                    let handle = match &executor {
                        Executor::Threads { pool, cancelled } => {
                            let spec = spec.clone();
                            let cancelled = cancelled.clone();
                            let job = pool.spawn_fifo_async(move || {
                                run_on_thread::<R>(&spec, &descriptor, &cancelled)
                            });
                            tasks.spawn(async move {
                                let _permits = permits;
                                job.await
                            })
                        }
                        Executor::Processes(pool) => {
                            let spec = spec.clone();
                            let pool = pool.clone();
                            tasks.spawn(async move {
                                let _permits = permits;
                                pool.run(&spec, &descriptor).await
                            })
                        }
                    };
                    in_flight.insert(handle.id(), chunk);
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(chunk, "dispatched task");
                }
                else => break Ok(()),
            }
        };

        match outcome {
            Ok(()) => {
                executor.shutdown().await;
                tracing::debug!(
                    dispatched = self.stats.dispatched(),
                    completed = self.stats.completed(),
                    "execution complete"
                );
                accumulator.finish()
            }
            Err(error) => {
                tracing::debug!(
                    dispatched = self.stats.dispatched(),
                    completed = self.stats.completed(),
                    in_flight = tasks.len(),
                    "execution failed, cancelling"
                );
                executor.cancel();
                tasks.shutdown().await;
                Err(error)
            }
        }
    }

    fn executor<R: Reducer>(&self) -> Result<Executor, ReductionError> {
        match &self.config.backend {
            Backend::Threads => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(self.config.worker_count)
                    .thread_name(|index| format!("chunkreduce-worker-{}", index))
                    .build()?;
                Ok(Executor::Threads {
                    pool,
                    cancelled: Arc::new(AtomicBool::new(false)),
                })
            }
            Backend::Processes { program } => {
                if Operation::from_name(R::NAME).is_none() {
                    return Err(ReductionError::UnsupportedOperation {
                        operation: R::NAME.to_string(),
                    });
                }
                Ok(Executor::Processes(Arc::new(ProcessPool::new(
                    program.clone(),
                    self.config.worker_count,
                ))))
            }
        }
    }
}

/// The workers of one execution.
enum Executor {
    Threads {
        pool: rayon::ThreadPool,
        cancelled: Arc<AtomicBool>,
    },
    Processes(Arc<ProcessPool>),
}

impl Executor {
    /// Stop queued tasks from starting.
    fn cancel(&self) {
        if let Executor::Threads { cancelled, .. } = self {
            cancelled.store(true, Ordering::Relaxed);
        }
    }

    /// Release idle workers.
    async fn shutdown(&self) {
        if let Executor::Processes(pool) = self {
            pool.shutdown().await;
        }
    }
}

/// Run a chunk task on a pool thread, turning a panic into a [ReductionError::WorkerFailure].
fn run_on_thread<R: Reducer>(
    spec: &TaskSpec,
    descriptor: &ChunkDescriptor,
    cancelled: &AtomicBool,
) -> Result<PartialResult, ReductionError> {
    let chunk = descriptor.id;
    if cancelled.load(Ordering::Relaxed) {
        return Err(ReductionError::WorkerFailure {
            chunk,
            reason: "cancelled".to_string(),
        });
    }
    std::panic::catch_unwind(AssertUnwindSafe(|| execute_task::<R>(spec, descriptor)))
        .unwrap_or_else(|panic| {
            let reason = if let Some(message) = panic.downcast_ref::<&str>() {
                format!("worker panicked: {}", message)
            } else if let Some(message) = panic.downcast_ref::<String>() {
                format!("worker panicked: {}", message)
            } else {
                "worker panicked".to_string()
            };
            Err(ReductionError::WorkerFailure { chunk, reason })
        })
}

/// A pool of worker processes, started on demand.
#[derive(Debug)]
struct ProcessPool {
    program: PathBuf,
    idle: Mutex<Vec<WorkerProcess>>,
    slots: Semaphore,
}

impl ProcessPool {
    fn new(program: PathBuf, size: usize) -> Self {
        Self {
            program,
            idle: Mutex::new(Vec::with_capacity(size)),
            slots: Semaphore::new(size),
        }
    }

    /// Run a task on an idle process, starting one if there is none.
    async fn run(
        &self,
        spec: &TaskSpec,
        descriptor: &ChunkDescriptor,
    ) -> Result<PartialResult, ReductionError> {
        let _slot = self.slots.acquire().await?;
        let idle = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut process = match idle {
            Some(process) => process,
            None => WorkerProcess::spawn(&self.program)?,
        };
        // A process that broke the protocol is dropped, and killed, here.
        let outcome = process.run(spec, descriptor).await?;
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(process);
        }
        match outcome {
            TaskOutcome::Done(partial) => Ok(partial),
            TaskOutcome::Failed(failure) => Err(failure.into_error(descriptor.id)),
        }
    }

    /// Stop all idle processes.
    async fn shutdown(&self) {
        let idle = match self.idle.lock() {
            Ok(mut idle) => std::mem::take(&mut *idle),
            Err(_) => return,
        };
        for process in idle {
            if let Err(error) = process.shutdown().await {
                tracing::warn!("failed to stop worker process: {}", error);
            }
        }
    }
}

/// Combines partial results of an execution.
trait Accumulate: Send {
    /// Add the result of the chunk starting at `offset`.
    fn add(&mut self, offset: usize, partial: &PartialResult) -> Result<(), ReductionError>;

    /// Return the combined result.
    fn finish(self: Box<Self>) -> Result<PartialResult, ReductionError>;
}

/// How partial results are combined.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    /// Every partial result covers the whole output.
    Fold,
    /// Each partial result covers a slice of the output along `axis`.
    Assemble { axis: usize },
}

struct Accumulator<R, T> {
    dtype: DType,
    mode: Mode,
    cells: ArrayD<(T, i64)>,
    samples: Option<Vec<(T, i64)>>,
    _reducer: PhantomData<R>,
}

impl<R: Reducer, T: Element> Accumulate for Accumulator<R, T> {
    fn add(&mut self, offset: usize, partial: &PartialResult) -> Result<(), ReductionError> {
        if partial.dtype != self.dtype {
            return Err(ReductionError::DTypeMismatch {
                expected: self.dtype,
                actual: partial.dtype,
            });
        }
        let cells = partial.to_cells::<T>()?;
        match self.mode {
            Mode::Fold => {
                if let Some(samples) = self.samples.as_mut() {
                    if samples.len() < MAX_SAMPLES {
                        samples.extend(cells.iter().find(|(_, count)| *count > 0));
                    }
                }
                combine_into::<R, T>(&mut self.cells, cells.view())
                    .map_err(|err| err.in_chunk(partial.chunk))
            }
            Mode::Assemble { axis } => {
                let incompatible = || ReductionError::IncompatibleShapes {
                    expected: self.cells.shape().to_vec(),
                    actual: cells.shape().to_vec(),
                };
                if cells.ndim() != self.cells.ndim() || axis >= cells.ndim() {
                    return Err(incompatible());
                }
                let length = cells.len_of(Axis(axis));
                let mut expected = self.cells.shape().to_vec();
                expected[axis] = length;
                if offset + length > self.cells.len_of(Axis(axis)) || expected != cells.shape() {
                    return Err(incompatible());
                }
                self.cells
                    .slice_axis_mut(Axis(axis), Slice::from(offset..offset + length))
                    .assign(&cells);
                Ok(())
            }
        }
    }

    fn finish(self: Box<Self>) -> Result<PartialResult, ReductionError> {
        if let Some(samples) = &self.samples {
            verify_contract::<R, T>(samples)?;
        }
        Ok(PartialResult::from_cells(0, self.dtype, &self.cells))
    }
}

/// Build an empty accumulator for the element type of the dataset.
struct NewAccumulator<'a, R> {
    spec: &'a TaskSpec,
    verify: bool,
    _reducer: PhantomData<R>,
}

impl<'a, R: Reducer> NumDispatch for NewAccumulator<'a, R> {
    type Output = Box<dyn Accumulate>;

    fn run_t<T: Element>(self) -> Result<Self::Output, ReductionError> {
        let mode = if self.spec.reduces_concat_axis() {
            Mode::Fold
        } else {
            let concat_axis = self.spec.layout.concat_axis;
            let reduced_before = self.spec.axes.iter().filter(|a| **a < concat_axis).count();
            Mode::Assemble {
                axis: concat_axis - reduced_before,
            }
        };
        let samples = (self.verify && mode == Mode::Fold).then(Vec::new);
        Ok(Box::new(Accumulator::<R, T> {
            dtype: self.spec.layout.dtype,
            mode,
            cells: ArrayD::from_elem(self.spec.output_shape(), (T::zero(), 0)),
            samples,
            _reducer: PhantomData,
        }))
    }
}
