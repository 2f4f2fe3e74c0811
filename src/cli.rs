//! Command Line Interface (CLI) arguments.

use std::path::PathBuf;

use byte_unit::Byte;
use clap::{Args, Parser, Subcommand, ValueEnum};
use expanduser::expanduser;

use crate::error::ReductionError;
use crate::models::{NanPolicy, Operation};
use crate::pipeline::PipelineConfig;
use crate::scheduler::{Backend, SchedulerConfig};
use crate::types::{DValue, Missing};
use crate::worker::current_program;

/// chunkreduce command line interface
#[derive(Clone, Debug, Parser)]
#[command(name = "chunkreduce", version, about)]
pub struct CommandLineArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Reduce a multi-file dataset
    Reduce(ReduceArgs),
    /// Print the chunk plan of a multi-file dataset as JSON lines
    Plan(DatasetArgs),
    /// Serve chunk tasks on stdin and stdout
    #[command(hide = true)]
    Worker,
}

/// Arguments describing a dataset and its chunking
#[derive(Clone, Debug, Args)]
pub struct DatasetArgs {
    /// Array files, in concatenation order
    #[arg(required = true, value_parser = expand_path)]
    pub files: Vec<PathBuf>,
    /// Dimension the files are concatenated along. Defaults to the first dimension.
    #[arg(long, env = "CHUNKREDUCE_CONCAT_DIM")]
    pub concat_dim: Option<String>,
    /// Elements per chunk along the concatenation dimension
    #[arg(long, default_value_t = 100, env = "CHUNKREDUCE_CHUNK_SIZE")]
    pub chunk_size: usize,
}

/// Where chunk tasks run
#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum BackendKind {
    /// Worker processes
    Processes,
    /// Threads of this process
    Threads,
}

#[derive(Clone, Debug, Args)]
pub struct ReduceArgs {
    #[command(flatten)]
    pub dataset: DatasetArgs,
    /// Reduction operator
    #[arg(long, short, value_enum, default_value_t = Operation::Max)]
    pub operation: Operation,
    /// Dimensions to reduce over, comma separated or repeated. All dimensions if not given.
    #[arg(long, short = 'd', value_delimiter = ',')]
    pub dims: Vec<String>,
    /// Number of workers. Defaults to the number of CPUs.
    #[arg(long, env = "CHUNKREDUCE_WORKERS")]
    pub workers: Option<usize>,
    /// Tasks in flight per worker
    #[arg(long, default_value_t = 2, env = "CHUNKREDUCE_PREFETCH_FACTOR")]
    pub prefetch_factor: usize,
    /// Where chunk tasks run
    #[arg(long, value_enum, default_value_t = BackendKind::Processes, env = "CHUNKREDUCE_BACKEND")]
    pub backend: BackendKind,
    /// Limit on the memory used by in-flight chunks, e.g. "2GiB"
    #[arg(long, value_parser = parse_memory_limit, env = "CHUNKREDUCE_MEMORY_LIMIT")]
    pub memory_limit: Option<usize>,
    /// NaN handling for floating point data
    #[arg(long, value_enum, default_value_t = NanPolicy::Ignore, env = "CHUNKREDUCE_NAN_POLICY")]
    pub nan_policy: NanPolicy,
    /// Value marking missing data, replacing any declared in the files
    #[arg(long, allow_negative_numbers = true, value_parser = parse_dvalue)]
    pub missing_value: Option<DValue>,
    /// Check partial results for order dependence before returning
    #[arg(long, default_value_t = false, env = "CHUNKREDUCE_VERIFY_OPERATOR")]
    pub verify_operator: bool,
    /// Write the JSON result to this file instead of stdout
    #[arg(long, short = 'O', value_parser = expand_path)]
    pub output: Option<PathBuf>,
}

impl ReduceArgs {
    /// Returns the pipeline configuration described by the arguments.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ReductionError> {
        let backend = match self.backend {
            BackendKind::Processes => Backend::Processes {
                program: current_program()?,
            },
            BackendKind::Threads => Backend::Threads,
        };
        let defaults = SchedulerConfig::default();
        Ok(PipelineConfig {
            concat_dim: self.dataset.concat_dim.clone(),
            chunk_size: self.dataset.chunk_size,
            nan_policy: self.nan_policy,
            missing: self.missing_value.clone().map(Missing::MissingValue),
            scheduler: SchedulerConfig {
                worker_count: self.workers.unwrap_or(defaults.worker_count),
                prefetch_factor: self.prefetch_factor,
                backend,
                memory_limit: self.memory_limit,
                verify_operator: self.verify_operator,
            },
            command: std::env::args().collect(),
        })
    }
}

fn expand_path(path: &str) -> Result<PathBuf, String> {
    expanduser(path).map_err(|err| format!("cannot expand {}: {}", path, err))
}

fn parse_memory_limit(limit: &str) -> Result<usize, String> {
    let bytes = Byte::parse_str(limit, /* ignore case */ true)
        .map_err(|err| format!("invalid memory limit: {}", err))?;
    usize::try_from(bytes.as_u64()).map_err(|err| format!("invalid memory limit: {}", err))
}

fn parse_dvalue(value: &str) -> Result<DValue, String> {
    value
        .parse::<DValue>()
        .map_err(|err| format!("invalid number {}: {}", value, err))
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
