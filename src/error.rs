//! Error handling.

use std::error::Error;
use std::path::{Path, PathBuf};

use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};

use crate::models::DType;
use crate::types::DValue;

/// chunkreduce error type
///
/// This type encapsulates the various errors that may occur while opening, planning, loading,
/// reducing and combining a dataset.
#[derive(Debug, Error)]
pub enum ReductionError {
    /// Reduction axis does not exist in the array
    #[error("axis {axis} is out of bounds for an array of {ndim} dimensions")]
    AxisOutOfBounds { axis: usize, ndim: usize },

    /// Chunk size of zero requested
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    /// Data type of a partial result does not match the dataset
    #[error("expected data type {expected}, got {actual}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Attempt to perform an invalid operation on an empty array or selection
    #[error("cannot perform {operation} on empty array or selection")]
    EmptyArray { operation: &'static str },

    /// No files, or no elements along the concatenation dimension
    #[error("dataset is empty")]
    EmptyDataset,

    /// Error converting from bytes to a type
    #[error("failed to convert from bytes to {type_name}")]
    FromBytes { type_name: &'static str },

    /// Array file header is not valid JSON or does not describe an array
    #[error("failed to decode header of {}", .path.display())]
    HeaderDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Incompatible missing data descriptor
    #[error("Incompatible value {0} for missing")]
    IncompatibleMissing(DValue),

    /// Partial results to combine have different shapes
    #[error("cannot combine partial result of shape {actual:?} into shape {expected:?}")]
    IncompatibleShapes {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Insufficient memory to process request
    #[error("Insufficient memory to process request ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// Array file header failed validation
    #[error("header of {} is not valid", .path.display())]
    InvalidHeader {
        path: PathBuf,
        #[source]
        source: validator::ValidationErrors,
    },

    /// Error reading a byte range of a file
    #[error(
        "failed to read {size} bytes at offset {offset} of {}{}",
        .path.display(),
        chunk_suffix(.chunk)
    )]
    Io {
        path: PathBuf,
        offset: u64,
        size: u64,
        chunk: Option<usize>,
        #[source]
        source: std::io::Error,
    },

    /// Error (de)serialising JSON
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// File does not start with the array file magic
    #[error("{} is not an array file", .path.display())]
    NotAnArrayFile { path: PathBuf },

    /// Error writing a result file
    #[error("failed to write {}", .path.display())]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Integer result does not fit in the data type
    #[error("{operator} overflowed the data type{}", chunk_suffix(.chunk))]
    Overflow {
        operator: String,
        chunk: Option<usize>,
    },

    /// Operator is not associative and commutative
    #[error("operator {operator} violates the reduction contract: {detail}")]
    OperatorContractViolation { operator: String, detail: String },

    /// A file disagrees with the first file of the dataset
    #[error("schema mismatch in {}: {reason}", .path.display())]
    SchemaMismatch { path: PathBuf, reason: String },

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error creating ndarray ArrayView from Shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error building the worker thread pool
    #[error("failed to build worker thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Error formatting a timestamp
    #[error("failed to format timestamp")]
    TimeFormat(#[from] time::error::Format),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Reduction over a dimension the dataset does not have
    #[error("unknown dimension {name}")]
    UnknownDimension { name: String },

    /// Output format without a metadata key
    #[error("unsupported output format {format}")]
    UnsupportedFormat { format: String },

    /// Unsupported operation requested
    #[error("unsupported operation {operation}")]
    UnsupportedOperation { operation: String },

    /// Error validating configuration
    #[error("configuration is not valid")]
    Validation(#[from] validator::ValidationErrors),

    /// A worker crashed, panicked or broke the worker protocol
    #[error("worker failed on chunk {chunk}: {reason}")]
    WorkerFailure { chunk: usize, reason: String },

    /// Error reading or writing the worker protocol pipes
    #[error("worker protocol pipe failed")]
    WorkerPipe(#[source] std::io::Error),

    /// Error starting a worker process
    #[error("failed to start worker process {}", .program.display())]
    WorkerSpawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn chunk_suffix(chunk: &Option<usize>) -> String {
    match chunk {
        Some(chunk) => format!(" (chunk {})", chunk),
        None => String::new(),
    }
}

impl ReductionError {
    /// Return an [ReductionError::Io] for a read of `size` bytes at `offset` of `path`.
    pub fn io(path: &Path, offset: u64, size: u64, source: std::io::Error) -> Self {
        ReductionError::Io {
            path: path.to_path_buf(),
            offset,
            size,
            chunk: None,
            source,
        }
    }

    /// Attach a chunk id to errors that carry one.
    pub fn in_chunk(self, id: usize) -> Self {
        match self {
            ReductionError::Io {
                path,
                offset,
                size,
                chunk: None,
                source,
            } => ReductionError::Io {
                path,
                offset,
                size,
                chunk: Some(id),
                source,
            },
            ReductionError::Overflow {
                operator,
                chunk: None,
            } => ReductionError::Overflow {
                operator,
                chunk: Some(id),
            },
            error => error,
        }
    }

    /// Attribute the error to the chunk task it occurred in.
    ///
    /// Errors without a chunk of their own become a [ReductionError::WorkerFailure], the same as
    /// they would when reported by a worker process. Failing to start a worker is not specific
    /// to the chunk and is kept as it is.
    pub fn for_chunk(self, chunk: usize) -> Self {
        match self {
            error @ (ReductionError::Io { .. }
            | ReductionError::Overflow { .. }
            | ReductionError::WorkerFailure { .. }
            | ReductionError::WorkerSpawn { .. }) => error.in_chunk(chunk),
            error => ReductionError::WorkerFailure {
                chunk,
                reason: ErrorBody::new(&error).to_string(),
            },
        }
    }

    /// Log the error and its chain of causes.
    pub fn log(&self) {
        event!(Level::ERROR, "{}", self);
        let mut current = self.source();
        while let Some(source) = current {
            event!(Level::ERROR, "Caused by: {}", source);
            current = source.source();
        }
    }
}

/// Report of an error and its causes
///
/// Implements serde (de)serialise.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorBody {
    /// Main error message
    pub message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    pub fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in self.caused_by.iter().flatten() {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// Failure of a chunk task, in a form that can cross a process boundary.
///
/// I/O errors keep their location so that they are rebuilt as [ReductionError::Io] by the
/// coordinator, and overflows stay [ReductionError::Overflow]. Everything else is reported as a [ReductionError::WorkerFailure].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    Io {
        path: PathBuf,
        offset: u64,
        size: u64,
        error: ErrorBody,
    },
    Overflow {
        operator: String,
    },
    Other {
        error: ErrorBody,
    },
}

impl From<&ReductionError> for TaskFailure {
    fn from(error: &ReductionError) -> Self {
        match error {
            ReductionError::Io {
                path,
                offset,
                size,
                source,
                ..
            } => TaskFailure::Io {
                path: path.clone(),
                offset: *offset,
                size: *size,
                error: ErrorBody::new(source),
            },
            ReductionError::Overflow { operator, .. } => TaskFailure::Overflow {
                operator: operator.clone(),
            },
            error => TaskFailure::Other {
                error: ErrorBody::new(error),
            },
        }
    }
}

impl TaskFailure {
    /// Rebuild the error for the chunk it occurred in.
    pub fn into_error(self, chunk: usize) -> ReductionError {
        match self {
            TaskFailure::Io {
                path,
                offset,
                size,
                error,
            } => ReductionError::Io {
                path,
                offset,
                size,
                chunk: Some(chunk),
                source: std::io::Error::new(std::io::ErrorKind::Other, error.to_string()),
            },
            TaskFailure::Overflow { operator } => ReductionError::Overflow {
                operator,
                chunk: Some(chunk),
            },
            TaskFailure::Other { error } => ReductionError::WorkerFailure {
                chunk,
                reason: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_reduction_error(
        error: ReductionError,
        message: &str,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let body = ErrorBody::new(&error);
        assert_eq!(message.to_string(), body.message);
        // Map Vec items from str to String
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, body.caused_by);
    }

    #[test]
    fn empty_array_op_error() {
        let error = ReductionError::EmptyArray { operation: "foo" };
        let message = "cannot perform foo on empty array or selection";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn from_bytes_error() {
        let error = ReductionError::FromBytes { type_name: "foo" };
        let message = "failed to convert from bytes to foo";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn incompatible_missing() {
        let error = ReductionError::IncompatibleMissing(32.into());
        let message = "Incompatible value 32 for missing";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn insufficient_memory() {
        let error = ReductionError::InsufficientMemory {
            requested: 2,
            total: 1,
        };
        let message = "Insufficient memory to process request (2 > 1)";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn io_error_with_chunk() {
        let source = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let error = ReductionError::io(Path::new("/data/b.arr"), 4096, 800, source).in_chunk(1);
        let message = "failed to read 800 bytes at offset 4096 of /data/b.arr (chunk 1)";
        let caused_by = Some(vec!["unexpected end of file"]);
        test_reduction_error(error, message, caused_by);
    }

    #[test]
    fn io_error_without_chunk() {
        let source = std::io::Error::from(std::io::ErrorKind::NotFound);
        let error = ReductionError::io(Path::new("a.arr"), 0, 16, source);
        let message = "failed to read 16 bytes at offset 0 of a.arr";
        let caused_by = Some(vec!["entity not found"]);
        test_reduction_error(error, message, caused_by);
    }

    #[test]
    fn schema_mismatch() {
        let error = ReductionError::SchemaMismatch {
            path: PathBuf::from("c.arr"),
            reason: "dtype int32 differs from float32".to_string(),
        };
        let message = "schema mismatch in c.arr: dtype int32 differs from float32";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn validation_errors() {
        let mut validation_errors = validator::ValidationErrors::new();
        validation_errors.add("bar", validator::ValidationError::new("foo"));
        let error = ReductionError::Validation(validation_errors);
        let message = "configuration is not valid";
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_reduction_error(error, message, caused_by);
    }

    #[tokio::test]
    async fn semaphore_acquire_error() {
        let sem = tokio::sync::Semaphore::new(1);
        sem.close();
        let error = ReductionError::SemaphoreAcquireError(sem.acquire().await.unwrap_err());
        let message = "error acquiring resources";
        let caused_by = Some(vec!["semaphore closed"]);
        test_reduction_error(error, message, caused_by);
    }

    #[test]
    fn shape_error() {
        let error =
            ReductionError::ShapeInvalid(ShapeError::from_kind(ndarray::ErrorKind::OutOfBounds));
        let message = "failed to create array from shape";
        let caused_by = Some(vec!["ShapeError/OutOfBounds: out of bounds indexing"]);
        test_reduction_error(error, message, caused_by);
    }

    #[test]
    fn try_from_int_error() {
        let error = ReductionError::TryFromInt(u8::try_from(-1_i8).unwrap_err());
        let message = "out of range integral type conversion attempted";
        test_reduction_error(error, message, None);
    }

    #[test]
    fn worker_failure() {
        let error = ReductionError::WorkerFailure {
            chunk: 3,
            reason: "worker panicked".to_string(),
        };
        test_reduction_error(error, "worker failed on chunk 3: worker panicked", None);
    }

    #[test]
    fn task_failure_keeps_io_kind() {
        let source = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let error = ReductionError::io(Path::new("b.arr"), 8, 4, source);
        let failure = TaskFailure::from(&error);
        let json = serde_json::to_string(&failure).unwrap();
        let failure: TaskFailure = serde_json::from_str(&json).unwrap();
        match failure.into_error(2) {
            ReductionError::Io {
                path,
                offset,
                size,
                chunk,
                source,
            } => {
                assert_eq!(PathBuf::from("b.arr"), path);
                assert_eq!((8, 4, Some(2)), (offset, size, chunk));
                assert_eq!("unexpected end of file", source.to_string());
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn task_failure_other() {
        let error = ReductionError::UnsupportedOperation {
            operation: "mean".to_string(),
        };
        match TaskFailure::from(&error).into_error(5) {
            ReductionError::WorkerFailure { chunk, reason } => {
                assert_eq!(5, chunk);
                assert_eq!("unsupported operation mean", reason);
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn overflow_error() {
        let error = ReductionError::Overflow {
            operator: "sum".to_string(),
            chunk: None,
        };
        test_reduction_error(error, "sum overflowed the data type", None);
        let error = ReductionError::Overflow {
            operator: "sum".to_string(),
            chunk: None,
        }
        .in_chunk(4);
        test_reduction_error(error, "sum overflowed the data type (chunk 4)", None);
    }

    #[test]
    fn task_failure_keeps_overflow_kind() {
        let error = ReductionError::Overflow {
            operator: "sum".to_string(),
            chunk: None,
        };
        let json = serde_json::to_string(&TaskFailure::from(&error)).unwrap();
        assert_eq!(r#"{"kind":"overflow","operator":"sum"}"#, json);
        let failure: TaskFailure = serde_json::from_str(&json).unwrap();
        match failure.into_error(7) {
            ReductionError::Overflow { operator, chunk } => {
                assert_eq!("sum", operator);
                assert_eq!(Some(7), chunk);
            }
            err => panic!("unexpected error {:?}", err),
        }
    }

    #[test]
    fn for_chunk_wraps_errors_without_chunk() {
        let error = ReductionError::FromBytes { type_name: "f32" }.for_chunk(6);
        match error {
            ReductionError::WorkerFailure { chunk, reason } => {
                assert_eq!(6, chunk);
                assert_eq!("failed to convert from bytes to f32", reason);
            }
            err => panic!("unexpected error {:?}", err),
        }
        let source = std::io::Error::from(std::io::ErrorKind::NotFound);
        let error = ReductionError::io(Path::new("a.arr"), 0, 16, source).for_chunk(2);
        assert!(matches!(error, ReductionError::Io { chunk: Some(2), .. }));
        let error = ReductionError::WorkerFailure {
            chunk: 1,
            reason: "worker panicked".to_string(),
        }
        .for_chunk(9);
        assert!(matches!(error, ReductionError::WorkerFailure { chunk: 1, .. }));
    }
}
